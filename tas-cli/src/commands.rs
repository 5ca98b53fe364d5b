//! Command execution.

use crate::{Binding, Commands};
use colored::Colorize;
use std::error::Error;
use tas_client::{
    ChannelDirection, ChannelMode, Client, ConnectionInfo, TargetClients,
};
use tas_protocol::{device_id_hash, hash_to_str, ServerInfo, TargetInfo};

/// Executes a command and returns the formatted output.
pub async fn execute(
    client: &Client,
    binding: &Binding,
    cmd: Commands,
) -> Result<String, Box<dyn Error>> {
    if cmd.needs_target() {
        ensure_bound(client, binding).await?;
    }

    match cmd {
        Commands::Repl => unreachable!(),

        // HashId is handled directly in main.rs (no server connection needed)
        Commands::HashId { .. } => unreachable!(),

        Commands::Info => Ok(format_server_info(client.server_info())),

        Commands::Targets => {
            let targets = client.list_targets().await?;
            Ok(format_targets(&targets))
        }

        Commands::Clients { target } => {
            let clients = client.get_target_clients(&target).await?;
            Ok(format_clients(&target, &clients))
        }

        Commands::Ping => {
            let info = client.target_ping().await?;
            Ok(format_con_info(&info))
        }

        Commands::Read { addr, len } => {
            let data = client.rw().read(addr, len).await?;
            Ok(hex_dump(addr, &data))
        }

        Commands::Write { addr, data } => {
            let bytes = parse_hex(&data)?;
            client.rw().write(addr, &bytes).await?;
            Ok(format!(
                "{} {} bytes at {}",
                "Wrote".green(),
                bytes.len(),
                format!("{:#010x}", addr).cyan()
            ))
        }

        Commands::Fill {
            addr,
            pattern,
            len,
            wide,
        } => {
            if wide {
                client.rw().fill64(addr, pattern, len).await?;
            } else {
                let pattern = u32::try_from(pattern)
                    .map_err(|_| "pattern does not fit in 32 bits; use --wide")?;
                client.rw().fill32(addr, pattern, len).await?;
            }
            Ok(format!(
                "{} {} bytes at {} with {:#x}",
                "Filled".green(),
                len,
                format!("{:#010x}", addr).cyan(),
                pattern
            ))
        }

        Commands::Reset { mode } => {
            client.reset_device(mode.into()).await?;
            let info = client.connection_info()?;
            Ok(format!(
                "{} {:?} (reset count: {})",
                "Device".green(),
                mode,
                info.reset_count
            ))
        }

        Commands::ChlSend { chl, text } => {
            let channels = client.chl();
            channels
                .subscribe(chl, ChannelDirection::Send, ChannelMode::Default)
                .await?;
            channels.send_string_on(chl, &text).await?;
            channels.unsubscribe_channel(chl).await?;
            Ok(format!("{} on channel {}", "Sent".green(), chl))
        }

        Commands::ChlRecv { chl, timeout_ms } => {
            let channels = client.chl();
            channels
                .subscribe(chl, ChannelDirection::Receive, ChannelMode::Default)
                .await?;
            let received = channels.rcv_string_on(chl, timeout_ms).await;
            channels.unsubscribe_channel(chl).await?;
            let (text, first) = received?;
            Ok(format_message(chl, &text, first))
        }
    }
}

/// Binds the client to the configured target unless it already is.
pub async fn ensure_bound(
    client: &Client,
    binding: &Binding,
) -> Result<ConnectionInfo, Box<dyn Error>> {
    if let Ok(info) = client.connection_info() {
        return Ok(info);
    }
    let target = binding
        .target
        .as_deref()
        .ok_or("no target selected; pass --target or set TAS_TARGET")?;
    let info = client
        .bind_session_with_password(target, &binding.session, &binding.password)
        .await?;
    Ok(info)
}

/// Prints the identity hash of a device id.
pub fn hash_id(words: &[u32]) -> Result<String, Box<dyn Error>> {
    let device_id: [u32; 4] = words
        .try_into()
        .map_err(|_| "a device id has exactly four words")?;
    let hash = device_id_hash(&device_id);
    Ok(format!("{} ({:#010x})", hash_to_str(hash), hash))
}

pub fn format_server_info(info: &ServerInfo) -> String {
    let started = info
        .start_time()
        .map(|t| t.to_rfc3339())
        .unwrap_or_else(|| "?".to_string());
    format!(
        "{} {}\n  Built: {}\n  Protocols: {:#06x}\n  Started: {}",
        info.server_name.cyan().bold(),
        info.version_string(),
        info.date,
        info.supp_protoc_ver,
        started
    )
}

pub fn format_targets(targets: &[TargetInfo]) -> String {
    if targets.is_empty() {
        return "No targets".yellow().to_string();
    }

    let mut output = String::new();
    for target in targets {
        output.push_str(&format!(
            "  {} [{}] type {:#x}, {:?}, {} client(s)\n",
            target.identifier.cyan(),
            hash_to_str(device_id_hash(&target.device_id)),
            target.device_type,
            target.dev_con_phys,
            target.num_client
        ));
    }
    output
}

pub fn format_clients(target: &str, clients: &TargetClients) -> String {
    if clients.clients.is_empty() {
        return format!("No clients on {}", target.cyan()).yellow().to_string();
    }

    let mut output = format!(
        "{} session '{}' (started at {} us)\n",
        target.cyan().bold(),
        clients.session_name,
        clients.session_start_time_us
    );
    for c in &clients.clients {
        output.push_str(&format!(
            "  {} ({}, pid {}, {:?}) in {} / out {}\n",
            c.client_name.cyan(),
            c.user_name,
            c.client_pid,
            c.client_type,
            format_bytes(c.num_byte_c2s),
            format_bytes(c.num_byte_s2c)
        ));
    }
    output
}

pub fn format_con_info(info: &ConnectionInfo) -> String {
    format!(
        "{} [{}]\n  Access width: {} byte(s)\n  Max batch: {} items\n  Address maps: {:#x}\n  \
         Messages: c2d {} x {} B, d2c {} x {} B\n  Reset count: {}",
        info.identifier.cyan().bold(),
        info.device_id_hash_str,
        info.access_width,
        info.max_batch_items,
        info.addr_map_mask,
        info.msg_num_c2d,
        info.msg_length_c2d,
        info.msg_num_d2c,
        info.msg_length_d2c,
        info.reset_count
    )
}

pub fn format_message(chl: u8, text: &str, first: bool) -> String {
    let marker = if first { "" } else { " (continued)" };
    format!("[{}]{} {}", chl.to_string().cyan(), marker.dimmed(), text)
}

/// Formats memory as rows of 16 bytes prefixed by their address.
pub fn hex_dump(addr: u64, data: &[u8]) -> String {
    let mut output = String::new();
    for (i, row) in data.chunks(16).enumerate() {
        let bytes = row
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect::<Vec<_>>()
            .join(" ");
        let ascii: String = row
            .iter()
            .map(|&b| if b.is_ascii_graphic() || b == b' ' { b as char } else { '.' })
            .collect();
        output.push_str(&format!(
            "{}  {:<47}  {}\n",
            format!("{:010x}", addr + (i * 16) as u64).cyan(),
            bytes,
            ascii.dimmed()
        ));
    }
    output
}

/// Formats bytes as human-readable string.
fn format_bytes(bytes: u64) -> String {
    if bytes >= 1024 * 1024 {
        format!("{:.2} MB", bytes as f64 / (1024.0 * 1024.0))
    } else if bytes >= 1024 {
        format!("{:.2} KB", bytes as f64 / 1024.0)
    } else {
        format!("{} B", bytes)
    }
}

/// Parses hex data, ignoring an optional `0x` prefix and separators.
pub fn parse_hex(s: &str) -> Result<Vec<u8>, Box<dyn Error>> {
    let digits: String = s
        .trim_start_matches("0x")
        .chars()
        .filter(|c| !matches!(c, ' ' | '_' | ':'))
        .collect();
    if digits.is_empty() {
        return Err("no data".into());
    }
    Ok(hex::decode(digits)?)
}

/// Parses a decimal or `0x`-prefixed integer.
pub fn parse_u64(s: &str) -> Result<u64, String> {
    let s = s.replace('_', "");
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| format!("invalid number '{}': {}", s, e))
}

pub fn parse_u32(s: &str) -> Result<u32, String> {
    let value = parse_u64(s)?;
    u32::try_from(value).map_err(|_| format!("{} does not fit in 32 bits", s))
}
