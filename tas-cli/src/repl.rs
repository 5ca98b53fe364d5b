//! Interactive REPL.

use crate::commands::{self, ensure_bound, parse_u32, parse_u64};
use crate::Binding;
use colored::Colorize;
use rustyline::error::ReadlineError;
use rustyline::history::DefaultHistory;
use rustyline::{Config, Editor};
use std::error::Error;
use tas_client::{ChannelDirection, ChannelMode, Client, ConnectionConfig, ResetMode};

const HELP_TEXT: &str = r#"
Available commands:
  help                              Show this help
  info                              Show server info
  targets                           List targets
  clients <target>                  List clients of a target

  bind <target> [session] [pw]      Bind this connection to a target
  ping                              Refresh and show connection info
  reset [hot|reset|halt]            Reset and/or halt the device

  read <addr> <len>                 Read memory
  write <addr> <hex>                Write memory
  fill <addr> <pattern> <len>       Fill memory with a 32-bit pattern
  fill64 <addr> <pattern> <len>     Fill memory with a 64-bit pattern

  sub <chl> [send|recv|bidi] [excl] [prio]   Subscribe to a channel
  unsub [chl]                       Release a channel (default: current)
  send [chl] <text>                 Send text (default: current channel)
  recv [chl] [timeout_ms]           Receive one message
  chl                               List held channels

  quit, exit                        Exit the REPL
"#;

pub async fn run(config: ConnectionConfig, binding: Binding) -> Result<(), Box<dyn Error>> {
    println!("{}", "TAS CLI".bold().cyan());
    println!("Connecting to {}...", config.endpoint);

    let client = Client::connect(config).await?;
    println!(
        "{} {} {}",
        "Connected to".green(),
        client.server_info().server_name,
        client.server_info().version_string()
    );

    if binding.target.is_some() {
        match ensure_bound(&client, &binding).await {
            Ok(info) => println!("{}", commands::format_con_info(&info)),
            Err(e) => println!("{}: {}", "Error".red(), e),
        }
    }

    let rl_config = Config::builder()
        .history_ignore_space(true)
        .auto_add_history(true)
        .build();
    let mut rl: Editor<(), DefaultHistory> = Editor::with_config(rl_config)?;

    let history_path = home::home_dir()
        .map(|h| h.join(".tas_history"))
        .unwrap_or_else(|| ".tas_history".into());
    let _ = rl.load_history(&history_path);

    println!("Type 'help' for available commands.\n");

    loop {
        let prompt = match client.connection_info() {
            Ok(info) => format!("{} ", format!("tas:{}>", info.identifier).cyan()),
            Err(_) => format!("{} ", "tas>".cyan()),
        };
        match rl.readline(&prompt) {
            Ok(line) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }

                match execute_repl_command(&client, line).await {
                    Ok(Some(output)) => println!("{}\n", output),
                    Ok(None) => break,
                    Err(e) => println!("{}: {}\n", "Error".red(), e),
                }
            }
            Err(ReadlineError::Interrupted) => {
                println!("^C");
                continue;
            }
            Err(ReadlineError::Eof) => {
                println!("^D");
                break;
            }
            Err(err) => {
                println!("{}: {:?}", "Error".red(), err);
                break;
            }
        }
    }

    let _ = rl.save_history(&history_path);

    let _ = client.close().await;
    println!("{}", "Disconnected.".dimmed());

    Ok(())
}

async fn execute_repl_command(
    client: &Client,
    line: &str,
) -> Result<Option<String>, Box<dyn Error>> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    if parts.is_empty() {
        return Ok(Some(String::new()));
    }

    let cmd = parts[0].to_lowercase();
    let args = &parts[1..];

    match cmd.as_str() {
        "help" | "?" => Ok(Some(HELP_TEXT.to_string())),

        "quit" | "exit" | "q" => Ok(None),

        "info" => Ok(Some(commands::format_server_info(client.server_info()))),

        "targets" | "t" => {
            let targets = client.list_targets().await?;
            Ok(Some(commands::format_targets(&targets)))
        }

        "clients" => {
            let Some(target) = args.first() else {
                return Ok(Some("Usage: clients <target>".to_string()));
            };
            let clients = client.get_target_clients(target).await?;
            Ok(Some(commands::format_clients(target, &clients)))
        }

        "bind" | "b" => {
            if args.is_empty() {
                return Ok(Some("Usage: bind <target> [session] [password]".to_string()));
            }
            let binding = Binding {
                target: Some(args[0].to_string()),
                session: args.get(1).unwrap_or(&"").to_string(),
                password: args.get(2).unwrap_or(&"").to_string(),
            };
            let info = ensure_bound(client, &binding).await?;
            Ok(Some(commands::format_con_info(&info)))
        }

        "ping" => {
            let info = client.target_ping().await?;
            Ok(Some(commands::format_con_info(&info)))
        }

        "reset" => {
            let mode = match args.first().copied().unwrap_or("reset") {
                "hot" => ResetMode::HotAttach,
                "reset" => ResetMode::Reset,
                "halt" => ResetMode::ResetAndHalt,
                other => return Ok(Some(format!("Unknown reset mode: {}", other))),
            };
            client.reset_device(mode).await?;
            Ok(Some(format!(
                "{} {:?} (reset count: {})",
                "Device".green(),
                mode,
                client.connection_info()?.reset_count
            )))
        }

        "read" | "r" => {
            if args.len() < 2 {
                return Ok(Some("Usage: read <addr> <len>".to_string()));
            }
            let addr = parse_u64(args[0])?;
            let len = parse_u32(args[1])?;
            let data = client.rw().read(addr, len).await?;
            Ok(Some(commands::hex_dump(addr, &data)))
        }

        "write" | "w" => {
            if args.len() < 2 {
                return Ok(Some("Usage: write <addr> <hex>".to_string()));
            }
            let addr = parse_u64(args[0])?;
            let data = commands::parse_hex(&args[1..].join(""))?;
            client.rw().write(addr, &data).await?;
            Ok(Some(format!("{} {} bytes", "Wrote".green(), data.len())))
        }

        "fill" | "fill64" => {
            if args.len() < 3 {
                return Ok(Some(format!("Usage: {} <addr> <pattern> <len>", cmd)));
            }
            let addr = parse_u64(args[0])?;
            let len = parse_u32(args[2])?;
            if cmd == "fill64" {
                client.rw().fill64(addr, parse_u64(args[1])?, len).await?;
            } else {
                client.rw().fill32(addr, parse_u32(args[1])?, len).await?;
            }
            Ok(Some(format!("{} {} bytes", "Filled".green(), len)))
        }

        "sub" => {
            let Some(chl) = args.first() else {
                return Ok(Some(
                    "Usage: sub <chl> [send|recv|bidi] [excl] [prio]".to_string(),
                ));
            };
            let chl: u8 = chl.parse()?;
            let direction = match args.get(1).copied().unwrap_or("bidi") {
                "send" => ChannelDirection::Send,
                "recv" => ChannelDirection::Receive,
                "bidi" => ChannelDirection::Bidirectional,
                other => return Ok(Some(format!("Unknown direction: {}", other))),
            };
            let mut mode = ChannelMode::Default;
            let mut prio = None;
            for arg in args.iter().skip(2) {
                if *arg == "excl" {
                    mode = ChannelMode::Exclusive;
                } else {
                    prio = Some(arg.parse::<u8>()?);
                }
            }
            let sub = client
                .chl()
                .subscribe_with_priority(chl, direction, mode, prio)
                .await?;
            Ok(Some(format!(
                "{} channel {} ({:?}, {:?}, prio {})",
                "Subscribed".green(),
                sub.chl.to_string().cyan(),
                sub.direction,
                sub.mode,
                sub.prio
            )))
        }

        "unsub" => {
            match args.first() {
                Some(chl) => client.chl().unsubscribe_channel(chl.parse()?).await?,
                None => client.chl().unsubscribe().await?,
            }
            Ok(Some("Released".green().to_string()))
        }

        "send" | "s" => {
            let channels = client.chl();
            match args {
                [] => return Ok(Some("Usage: send [chl] <text>".to_string())),
                [first, rest @ ..] if !rest.is_empty() && first.parse::<u8>().is_ok() => {
                    channels.send_string_on(first.parse()?, &rest.join(" ")).await?
                }
                _ => channels.send_string(&args.join(" ")).await?,
            }
            Ok(Some("Sent".green().to_string()))
        }

        "recv" => {
            let channels = client.chl();
            let timeout_ms = match args.get(1) {
                Some(t) => t.parse()?,
                None => 1000,
            };
            let (chl, (text, first)) = match args.first() {
                Some(chl) => {
                    let chl: u8 = chl.parse()?;
                    (chl, channels.rcv_string_on(chl, timeout_ms).await?)
                }
                None => {
                    let Some(current) = channels.current().await else {
                        return Ok(Some("No channel subscribed".yellow().to_string()));
                    };
                    (current.chl, channels.rcv_string(timeout_ms).await?)
                }
            };
            Ok(Some(commands::format_message(chl, &text, first)))
        }

        "chl" => {
            let subs = client.chl().subscriptions().await;
            if subs.is_empty() {
                return Ok(Some("No channels held".yellow().to_string()));
            }
            let mut output = String::new();
            for sub in subs {
                output.push_str(&format!(
                    "  {} {:?} {:?} prio {}\n",
                    sub.chl.to_string().cyan(),
                    sub.direction,
                    sub.mode,
                    sub.prio
                ));
            }
            Ok(Some(output))
        }

        _ => Ok(Some(format!(
            "Unknown command: {}. Type 'help' for help.",
            cmd
        ))),
    }
}
