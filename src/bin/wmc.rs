use clap::Parser;
use std::path::PathBuf;
use tokio::signal;
use tokio::sync::mpsc;
use tracing::{debug, info};
use wmconn::{Connection, Encoding, Value};

type Error = Box<dyn std::error::Error + Send + Sync>;

/// Sends a single command to the watchman service and prints the response.
#[derive(Parser, Debug)]
struct Args {
    /// Path to the service's socket. Resolved with `watchman get-sockname` when omitted
    #[arg(short, long, env = "WATCHMAN_SOCK")]
    sockname: Option<PathBuf>,

    /// Encoding to speak on the wire
    #[arg(short, long, default_value_t = Encoding::Bser)]
    encoding: Encoding,

    /// Capability to require during the handshake. May be repeated
    #[arg(short, long = "require")]
    required: Vec<String>,

    /// Keep printing unsolicited PDUs, such as subscription updates, until interrupted
    #[arg(short, long)]
    follow: bool,

    /// The command as a JSON array, for example '["watch-list"]'
    command: String,
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    let args = Args::parse();

    let _ = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| debug!("Failed to initialize global tracing: {}", e));

    let command: serde_json::Value = serde_json::from_str(&args.command)?;

    let (tx, mut unsolicited) = mpsc::unbounded_channel();
    let mut builder = Connection::builder()
        .encoding(args.encoding)
        .on_unsolicited(move |pdu| {
            let _ = tx.send(pdu);
        });
    if let Some(sockname) = args.sockname {
        builder = builder.sock_path(sockname);
    }
    let conn = builder.build()?;

    let version_args = if args.required.is_empty() {
        Connection::default_version_args()
    } else {
        Value::object([("required", Value::array(args.required))])
    };
    let version = conn.connect(version_args).await?;
    let server_version = version.get("version").cloned().unwrap_or_default();
    info!("Connected to watchman {}", server_version);

    let response = conn.run(Value::from(command)).await?;
    print(response)?;

    if args.follow {
        loop {
            tokio::select! {
                pdu = unsolicited.recv() => match pdu {
                    Some(Ok(pdu)) => print(pdu)?,
                    Some(Err(err)) => return Err(err.into()),
                    None => break,
                },
                _ = signal::ctrl_c() => break,
            }
        }
    }

    conn.close();
    conn.closed().await;

    Ok(())
}

fn print(value: Value) -> Result<(), Error> {
    let json = serde_json::Value::from(value);
    println!("{}", serde_json::to_string_pretty(&json)?);
    Ok(())
}
