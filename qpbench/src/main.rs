use std::process::ExitCode;

use anyhow::{bail, Context as _};
use clap::Parser;
use qpbench_shared::{
    backend::{Outcome, Workload},
    client::run_test,
    server::Server,
    session::Context,
};
use tracing::error;
use tracing_subscriber::EnvFilter;

use crate::command_line::GlobalArgs;

mod command_line;
mod report;

fn main() -> ExitCode {
    let args = GlobalArgs::parse();

    let default_level = if args.verbose > 0 { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

fn transports() -> Context {
    #[cfg(feature = "verbs")]
    {
        use std::sync::Arc;

        use qpbench_shared::rdma_controller::verbs::VerbsDevice;

        Context {
            rdma: Some(Arc::new(VerbsDevice::new())),
        }
    }
    #[cfg(not(feature = "verbs"))]
    Context::default()
}

fn run(args: &GlobalArgs) -> anyhow::Result<()> {
    let Some(host) = &args.host else {
        let server = Server::bind(args.port, transports())
            .with_context(|| format!("starting server on port {}", args.port))?;
        return Ok(server.serve()?);
    };

    if args.tests.is_empty() {
        bail!("no tests given for {host}");
    }
    let workloads = args
        .tests
        .iter()
        .map(|name| Workload::from_name(name))
        .collect::<Result<Vec<_>, _>>()?;

    let mut params = args.params()?;
    let wait = args.wait()?;
    let context = transports();

    for workload in workloads {
        let outcome = run_test(host, args.port, wait, &mut params, workload, context.clone())
            .with_context(|| format!("{workload} against {host}"))?;
        print!("{}", report::render(&outcome, args.verbose > 0));
        if outcome == Outcome::Quit {
            break;
        }
    }
    Ok(())
}
