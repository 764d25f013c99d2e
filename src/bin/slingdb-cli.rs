use std::process;

use structopt::StructOpt;

use slingdb::{
    client::Client,
    proto::wire::Mode,
};

#[derive(Clone, StructOpt)]
#[structopt(name = "slingdb-cli", about = "SLINGDB command-line client")]
pub struct Opt {
    #[structopt(long = "db", help = "[<host>[:<port>]/]<database>")]
    db: String,

    #[structopt(subcommand)]
    subcmd: SubCommand,
}

#[derive(Clone, StructOpt)]
pub enum SubCommand {
    /// Fetch a record's value.
    Get { key: String },
    /// Fetch a record's version and size without its value.
    Head { key: String },
    /// Add or overwrite a record.
    Put {
        key: String,
        value: String,
        #[structopt(long = "version", default_value = "0")]
        version: u64,
        #[structopt(long = "mode", default_value = "overwrite", help = "overwrite|add|ordered|newer")]
        mode: String,
    },
    /// Delete a record.
    Delete { key: String },
    /// Print the database's current epoch.
    Epoch,
}

fn main() {
    env_logger::init();

    let opts = Opt::from_iter(std::env::args_os());
    if let Err(err) = run(opts) {
        eprintln!("slingdb-cli: {}", err);
        process::exit(1);
    }
}

fn parse_mode(s: &str) -> Mode {
    match s {
        "add" => Mode::Add,
        "ordered" => Mode::Ordered,
        "newer" => Mode::Newer,
        _ => Mode::Overwrite,
    }
}

fn run(opts: Opt) -> slingdb::Result<()> {
    let mut client = Client::connect(&opts.db)?;

    match opts.subcmd {
        SubCommand::Get { key } => match client.get(key.as_bytes())? {
            Some(rec) => println!("{}", String::from_utf8_lossy(&rec.value)),
            None => println!("(not found)"),
        },
        SubCommand::Head { key } => match client.head(key.as_bytes())? {
            Some((version, vsize)) => println!("version={} size={}", version, vsize),
            None => println!("(not found)"),
        },
        SubCommand::Put {
            key,
            value,
            version,
            mode,
        } => {
            let outcome = client.put(key.as_bytes(), version, value.as_bytes(), parse_mode(&mode))?;
            println!("{:?} version={}", outcome.result, outcome.version);
        }
        SubCommand::Delete { key } => {
            let found = client.delete(key.as_bytes())?;
            println!("{}", found);
        }
        SubCommand::Epoch => println!("{}", client.epoch()?),
    }

    Ok(())
}
