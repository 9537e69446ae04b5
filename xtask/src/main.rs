/*
Copyright 2023 The Kubernetes Authors.

SPDX-License-Identifier: (GPL-2.0-only OR BSD-2-Clause)
*/

mod build_proto;
mod gen_crds;
mod grpc;
mod run;

use std::process::exit;

use clap::Parser;

#[derive(Debug, Parser)]
pub struct Options {
    #[clap(subcommand)]
    command: Command,
}

#[derive(Debug, Parser)]
enum Command {
    RunControlplane(run::Options),
    BuildProto(build_proto::Options),
    GrpcClient(grpc::Options),
    GenCrds(gen_crds::Options),
}

#[tokio::main]
async fn main() {
    let opts = Options::parse();

    use Command::*;
    let ret = match opts.command {
        BuildProto(opts) => build_proto::build_proto(opts),
        RunControlplane(opts) => run::run_controlplane(opts),
        GrpcClient(opts) => grpc::run(opts).await,
        GenCrds(opts) => gen_crds::gen_crds(opts),
    };

    if let Err(e) = ret {
        eprintln!("{:#}", e);
        exit(1);
    }
}
