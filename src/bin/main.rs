// Copyright (c) Nettrace Contributors
// SPDX-License-Identifier: MIT

use std::{path::PathBuf, time::Duration};
use structopt::StructOpt;
use tracing::Level;
use nettrace::{
    config::ConfigStore,
    kernel::loader::{LoaderKernel, DEFAULT_LOADER_SOCKET},
    probes,
    supervisor::{self, Supervisor, SupervisorOpts},
};

#[derive(StructOpt)]
#[structopt(
    name = "nettrace",
    about = "Attributes kernel network events to the originating process and its ancestry."
)]
struct Opts {
    #[structopt(short, long, help = "yaml file with per-probe configuration")]
    config: PathBuf,

    #[structopt(
        short = "f",
        long = "output_file",
        default_value = "-",
        help = "file to output to (default is STDOUT, denoted by -)"
    )]
    output_file: String,

    #[structopt(
        short,
        long,
        help = "don't run, just print the kernel programs to be compiled and quit"
    )]
    print_and_quit: bool,

    #[structopt(short, long, help = "watch the config source and apply changes")]
    watch_config: bool,

    #[structopt(long, default_value = "60", help = "seconds between health checks")]
    health_check_period: u64,

    #[structopt(
        long,
        default_value = "0",
        help = "emit lost-event telemetry every N events, disabled if <= 0"
    )]
    lost_event_telemetry: i64,

    #[structopt(long, help = "additional probe names to enable")]
    extra_probe_path: Vec<String>,

    #[structopt(long, help = "additional plugin names to enable")]
    extra_plugin_path: Vec<String>,

    #[structopt(long, help = "unix socket of the privileged program loader")]
    loader_socket: Option<PathBuf>,
}

fn main() -> anyhow::Result<()> {
    let opts = Opts::from_args();

    tracing_subscriber::fmt()
        .with_max_level(Level::INFO)
        .init();

    supervisor::validate_extra_paths(&opts.extra_probe_path, &opts.extra_plugin_path)?;
    let store = ConfigStore::load(&opts.config)?;

    if opts.print_and_quit {
        for (name, config) in store.probes() {
            println!("----- {} -----", name);
            println!("{}", probes::render_named_program(name, config)?);
            println!();
        }
        return Ok(());
    }

    let loader_socket = opts
        .loader_socket
        .unwrap_or_else(|| PathBuf::from(DEFAULT_LOADER_SOCKET));
    let kernel = LoaderKernel::new(loader_socket);
    let supervisor = Supervisor::new(
        kernel,
        store,
        SupervisorOpts {
            output_file: opts.output_file,
            health_check_period: Duration::from_secs(opts.health_check_period.max(1)),
            lost_event_telemetry: if opts.lost_event_telemetry > 0 {
                Some(opts.lost_event_telemetry as u64)
            } else {
                None
            },
            watch_config: opts.watch_config,
        },
    );

    let runtime = tokio::runtime::Runtime::new()?;
    let exit_code = runtime.block_on(supervisor.run())?;
    std::process::exit(exit_code);
}
