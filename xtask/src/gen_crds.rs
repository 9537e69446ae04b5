/*
Copyright 2023 The Kubernetes Authors.

SPDX-License-Identifier: (GPL-2.0-only OR BSD-2-Clause)
*/

use clap::Parser;
use kube::CustomResourceExt;

use controlplane::proxyconfig::ProxyConfig;

#[derive(Debug, Parser)]
pub struct Options {}

// Prints the ProxyConfig CRD manifest; pipe into kubectl apply.
pub(crate) fn gen_crds(_opts: Options) -> Result<(), anyhow::Error> {
    println!("{}", serde_yaml::to_string(&ProxyConfig::crd())?);
    Ok(())
}
