use std::{path::PathBuf, process, sync::Arc, time::Duration};

use structopt::StructOpt;

use slingdb::{net::Server, service::SessionHandler, service::Service};

#[derive(Clone, StructOpt)]
#[structopt(name = "slingdb-server", about = "SLINGDB keyed record-store server")]
pub struct Opt {
    #[structopt(long = "addr", default_value = "0.0.0.0", help = "address to bind")]
    addr: String,

    #[structopt(long = "port", default_value = "7070", help = "port to bind")]
    port: u16,

    #[structopt(long = "dbdir", help = "directory holding database files")]
    dbdir: PathBuf,

    #[structopt(long = "workers", default_value = "8", help = "worker thread pool size")]
    workers: usize,

    #[structopt(long = "recover", help = "attempt recovery when mounting at startup")]
    recover: bool,

    #[structopt(long = "auto_mount", help = "comma-separated database names to mount at startup")]
    auto_mount: Option<String>,
}

fn main() {
    env_logger::init();

    let opts = Opt::from_iter(std::env::args_os());
    if let Err(err) = run(opts) {
        eprintln!("slingdb-server: {}", err);
        process::exit(1);
    }
}

fn run(opts: Opt) -> slingdb::Result<()> {
    let mut service = Service::new(&opts.dbdir);

    if let Some(names) = &opts.auto_mount {
        for name in names.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            service.mount(name, opts.recover)?;
        }
    }

    service.start_checkpoint_thread();

    let handler = Arc::new(SessionHandler::new(service.mounts(), service.dbdir().to_path_buf()));
    let addr = format!("{}:{}", opts.addr, opts.port);
    let server = Server::bind(&addr, handler, opts.workers, Duration::from_secs(86_400))?;

    let result = server.serve();
    service.flush_all();
    service.stop_checkpoint_thread()?;
    result
}
