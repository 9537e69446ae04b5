/*
Copyright 2023 The Kubernetes Authors.

SPDX-License-Identifier: (GPL-2.0-only OR BSD-2-Clause)
*/

use std::{os::unix::process::CommandExt, process::Command};

use anyhow::Context as _;
use clap::Parser;

#[derive(Debug, Parser)]
pub struct Options {
    /// Build and run the release target
    #[clap(long)]
    pub release: bool,
    /// Arguments to pass to your application
    #[clap(name = "args", last = true)]
    pub run_args: Vec<String>,
}

/// Build the controlplane
fn build_controlplane(opts: &Options) -> Result<(), anyhow::Error> {
    let mut args = vec!["build", "--package", "controlplane"];
    if opts.release {
        args.push("--release")
    }
    let status = Command::new("cargo")
        .args(&args)
        .status()
        .expect("failed to build controlplane");
    assert!(status.success());
    Ok(())
}

pub fn run_controlplane(opts: Options) -> Result<(), anyhow::Error> {
    build_controlplane(&opts).context("Error while building controlplane")?;

    // profile we are building (release or debug)
    let profile = if opts.release { "release" } else { "debug" };
    let bin_path = format!("target/{}/controller", profile);

    // spawn the command
    let err = Command::new(&bin_path)
        .args(opts.run_args.iter())
        .env("RUST_LOG", "info")
        .exec();

    // we shouldn't get here unless the command failed to spawn
    Err(anyhow::Error::from(err).context(format!("Failed to run `{}`", bin_path)))
}
