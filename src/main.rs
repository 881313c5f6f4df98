use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use netemu::config::RuntimeConfig;
use netemu::ctx::ThreadCtx;
use netemu::plugin::PluginRegistry;
use netemu::plugins::register_defaults;
use netemu::transport::ipc::IpcTransport;
use netemu::transport::tcp::TcpTransport;
use netemu::transport::{SimTransport, Transport};
use netemu::worker::Worker;

#[derive(Parser)]
#[command(name = "netemu")]
#[command(about = "Emulates client populations and their L2/L3 control traffic")]
#[command(disable_version_flag = true)]
struct Args {
    /// RPC port
    #[arg(short = 'p', long = "port", default_value_t = 4510)]
    port: u16,

    /// Data-plane port (TCP tx uses this + 1)
    #[arg(short = 'l', long = "veth-port", default_value_t = 4511)]
    veth_port: u16,

    /// Verbose logging
    #[arg(short = 'v', long)]
    verbose: bool,

    /// Simulator mode
    #[arg(short = 's', long = "sim")]
    sim: bool,

    /// Data-plane server IP
    #[arg(short = 'S', long = "server", default_value = "127.0.0.1")]
    server: String,

    /// Record a capture of every frame and RPC exchange
    #[arg(short = 'c', long)]
    capture: bool,

    /// Dump every frame as K12 text
    #[arg(short = 'm', long)]
    monitor: bool,

    /// Simulation duration in seconds
    #[arg(short = 't', long = "time", default_value_t = 10)]
    time: u64,

    /// Capture output path
    #[arg(short = 'f', long = "file", default_value = "emu_file")]
    file: PathBuf,

    /// Dummy sink: every tx frame is dropped by the simulated DUT
    #[arg(short = 'd', long = "dummy-veth")]
    dummy_veth: bool,

    /// Print version and exit
    #[arg(short = 'V', long = "version")]
    version: bool,

    /// TCP framing for the data plane instead of the default IPC sockets
    #[arg(long = "emu-zmq-tcp")]
    emu_zmq_tcp: bool,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    if args.version {
        println!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    let default = if args.verbose { "netemu=debug" } else { "netemu=info" };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let mut registry = PluginRegistry::new();
    register_defaults(&mut registry)?;

    let veth: Box<dyn Transport> = if args.sim || args.dummy_veth {
        if args.dummy_veth {
            info!("dummy veth: the simulated DUT drops all traffic");
            Box::new(SimTransport::sink())
        } else {
            Box::new(SimTransport::loopback())
        }
    } else if args.emu_zmq_tcp {
        info!(rpc = args.port, rx = args.veth_port, tx = args.veth_port + 1, "tcp data plane");
        Box::new(TcpTransport::connect(&args.server, args.veth_port, args.port)?)
    } else {
        info!(rpc = args.port, data = args.veth_port, "ipc data plane");
        Box::new(IpcTransport::connect(args.veth_port, args.port)?)
    };

    let cfg = RuntimeConfig::default();
    let ticks_per_sec = 1000 / cfg.tick_period_ms;
    let ctx = ThreadCtx::new(cfg, registry, veth);

    if args.monitor {
        ctx.set_monitor(Box::new(std::io::stdout()));
    }
    let recorder = args.capture.then(|| ctx.enable_capture());

    let mut worker = Worker::new(ctx.clone());
    if args.sim || args.dummy_veth {
        let ticks = args.time * ticks_per_sec;
        info!(seconds = args.time, ticks, "running simulation");
        worker.run_sim(ticks);
    } else {
        worker.run(Arc::new(AtomicBool::new(false)));
    }

    if let Some(recorder) = recorder {
        info!(path = %args.file.display(), records = recorder.len(), "writing capture");
        recorder.export(&args.file)?;
    }

    ctx.teardown();
    Ok(())
}
