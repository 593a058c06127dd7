//! `multegula-node`: join a mesh from a cluster file and drive it from the
//! terminal.

use {
    clap::{crate_description, crate_version, value_t, App, Arg, ArgMatches},
    log::{error, info},
    multegula_message_passer::{
        Bootstrap, ClusterConfig, Message, MessagePasser, MessagePasserError, Node,
        StaticBootstrap,
    },
    std::process::exit,
    tokio::io::{AsyncBufReadExt, BufReader},
};

const HELP: &str = "commands:
  s <dest> <kind> <content...>   send a direct message
  m <kind> <content...>          multicast to the group
  r                              print messages received so far
  q                              quit";

#[derive(Debug, PartialEq, Eq)]
enum ConsoleCommand {
    Send {
        destination: String,
        kind: String,
        content: String,
    },
    Multicast {
        kind: String,
        content: String,
    },
    Receive,
    Quit,
}

/// Parse one console line.  `None` for blank or unrecognised input.
fn parse_command(line: &str) -> Option<ConsoleCommand> {
    let mut words = line.split_whitespace();
    let command = match words.next()? {
        "s" => {
            let destination = words.next()?.to_string();
            let kind = words.next()?.to_string();
            ConsoleCommand::Send {
                destination,
                kind,
                content: words.collect::<Vec<_>>().join(" "),
            }
        }
        "m" => {
            let kind = words.next()?.to_string();
            ConsoleCommand::Multicast {
                kind,
                content: words.collect::<Vec<_>>().join(" "),
            }
        }
        "r" => ConsoleCommand::Receive,
        "q" => ConsoleCommand::Quit,
        _ => return None,
    };
    Some(command)
}

fn app<'a, 'b>() -> App<'a, 'b> {
    App::new("multegula-node")
        .version(crate_version!())
        .about(crate_description!())
        .arg(
            Arg::with_name("config")
                .long("config")
                .short("c")
                .value_name("FILE")
                .takes_value(true)
                .required(true)
                .help("Cluster file with [passer], [[nodes]] and optional rule tables"),
        )
        .arg(
            Arg::with_name("name")
                .long("name")
                .short("n")
                .value_name("NAME")
                .takes_value(true)
                .required(true)
                .help("Name of this node"),
        )
        .arg(
            Arg::with_name("address")
                .long("address")
                .value_name("HOST")
                .takes_value(true)
                .default_value("127.0.0.1")
                .help("Address peers use to reach this node when it is not in the cluster file"),
        )
        .arg(
            Arg::with_name("port")
                .long("port")
                .short("p")
                .value_name("PORT")
                .takes_value(true)
                .help("Port of this node when it is not in the cluster file"),
        )
        .arg(
            Arg::with_name("log")
                .long("log")
                .value_name("FILTER")
                .takes_value(true)
                .default_value("info")
                .help("Default log filter, overridden by RUST_LOG"),
        )
}

/// The local node as listed in the cluster file, or built from the
/// command line.
fn local_node(matches: &ArgMatches<'_>, cluster: &ClusterConfig) -> Result<Node, String> {
    let name = matches.value_of("name").unwrap_or_default();
    if let Some(node) = cluster.nodes.iter().find(|n| n.name == name) {
        return Ok(node.clone());
    }
    if matches.value_of("port").is_none() {
        return Err(format!("{name} is not in the cluster file, pass --port"));
    }
    let port = value_t!(matches, "port", u16).map_err(|e| e.message)?;
    let address = matches.value_of("address").unwrap_or("127.0.0.1");
    Ok(Node::new(name, address, port))
}

async fn run(matches: ArgMatches<'static>) -> Result<(), MessagePasserError> {
    let path = matches.value_of("config").unwrap_or_default();
    let cluster = ClusterConfig::load(path)?;
    let local = local_node(&matches, &cluster).map_err(MessagePasserError::Config)?;
    let nodes = StaticBootstrap::new(cluster.nodes.clone()).peers(&local)?;

    info!("{} joining {} nodes from {}", local, nodes.len(), path);
    let mut passer =
        MessagePasser::init(cluster.passer.clone(), nodes, &local.name, cluster.rules()).await?;
    println!(
        "{} connected to {} nodes\n{}",
        passer.local_name(),
        passer.connection_count(),
        HELP
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let Some(command) = parse_command(&line) else {
            if !line.trim().is_empty() {
                println!("{HELP}");
            }
            continue;
        };
        match command {
            ConsoleCommand::Send {
                destination,
                kind,
                content,
            } => passer.send(Message::new(destination, kind, content)).await,
            ConsoleCommand::Multicast { kind, content } => {
                passer.multicast(Message::multicast(kind, content)).await
            }
            ConsoleCommand::Receive => {
                let mut count = 0usize;
                while let Some(message) = passer.try_receive() {
                    count = count.saturating_add(1);
                    println!(
                        "[{}] {} -> {} #{} {:?}: {}",
                        message.kind,
                        message.source,
                        message.destination,
                        message.seq_num,
                        message.timestamp,
                        message.content
                    );
                }
                if count == 0 {
                    println!("nothing received");
                }
            }
            ConsoleCommand::Quit => break,
        }
    }

    passer.shutdown().await;
    Ok(())
}

#[tokio::main]
async fn main() {
    let matches = app().get_matches();
    let filter = matches.value_of("log").unwrap_or("info").to_string();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(filter)).init();

    if let Err(e) = run(matches).await {
        error!("{e}");
        exit(1);
    }
}
