use clap::Parser;
use redmux::commands::Command;
use redmux::{Connection, Error};

#[derive(Parser, Debug)]
struct Args {
    /// Connection configuration, e.g. "127.0.0.1:6379" or
    /// "10.0.0.1:26379,serviceName=mymaster"
    #[arg(short, long, default_value = "127.0.0.1:6379")]
    config: String,

    /// Logical database to run the command against
    #[arg(short, long, default_value_t = 0)]
    db: i64,

    /// Command and arguments, e.g. `GET mykey`; pings when omitted
    command: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    tracing_subscriber::fmt().init();

    let args = Args::parse();
    let connection = Connection::connect(&args.config).await?;

    if args.command.is_empty() {
        let latency = connection.ping().await?;
        println!("PONG in {:?}", latency);
    } else {
        let mut command = Command::new(args.command[0].to_uppercase());
        for arg in &args.command[1..] {
            command = command.arg(arg);
        }
        let reply = connection.raw(Some(args.db), command)?.wait().await?;
        println!("{}", reply);
    }

    println!("{}", connection.counters());
    connection.close().await;
    Ok(())
}
