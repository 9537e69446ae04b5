/*
Copyright 2023 The Kubernetes Authors.

SPDX-License-Identifier: (GPL-2.0-only OR BSD-2-Clause)
*/

// Debug client for the proxy's route control channel: inspect the live
// table, check proxy health, or push an empty table by hand.

use std::net::SocketAddr;

use anyhow::Error;
use clap::Parser;

use routes::routes::routes_client::RoutesClient;
use routes::routes::{GetRoutesRequest, HealthRequest, UpdateRoutesRequest};

#[derive(Debug, Parser)]
pub struct Options {
    #[clap(default_value = "127.0.0.1", long)]
    pub server_ip: String,
    #[clap(default_value = "9090", long)]
    pub server_port: u32,
    #[clap(subcommand)]
    pub command: Command,
}

#[derive(Debug, Parser)]
pub enum Command {
    /// Print the proxy's current route table.
    GetRoutes,
    /// Check the proxy's health endpoint.
    Health,
    /// Push an empty route table under the given version.
    Clear {
        #[clap(default_value = "1", long)]
        version: u64,
    },
}

pub async fn run(opts: Options) -> Result<(), Error> {
    let server_addr: SocketAddr = format!("{}:{}", opts.server_ip, opts.server_port).parse()?;

    let mut client = RoutesClient::connect(format!("http://{server_addr}")).await?;

    match opts.command {
        Command::GetRoutes => {
            let res = client.get_routes(GetRoutesRequest {}).await?.into_inner();
            println!(
                "grpc server responded with {} http route(s), {} grpc route(s)",
                res.http_routes.len(),
                res.grpc_routes.len()
            );
            for route in res.http_routes {
                println!("http  {} hostnames={:?} rules={}", route.id, route.hostnames, route.rules.len());
            }
            for route in res.grpc_routes {
                println!("grpc  {} hostnames={:?} rules={}", route.id, route.hostnames, route.rules.len());
            }
        }
        Command::Health => {
            let res = client.health(HealthRequest {}).await?.into_inner();
            println!("grpc server responded to HEALTH: healthy={}", res.healthy);
        }
        Command::Clear { version } => {
            let res = client
                .update_routes(UpdateRoutesRequest {
                    http_routes: vec![],
                    grpc_routes: vec![],
                    version,
                })
                .await?
                .into_inner();
            println!(
                "grpc server responded to UPDATE: success={} applied_version={}",
                res.success, res.applied_version
            );
        }
    }

    Ok(())
}
