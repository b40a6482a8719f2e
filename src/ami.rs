//! PBX AMI client (§4.10 INIT step, §6 external interfaces).
//!
//! Asterisk Manager Interface is a line-oriented TCP protocol: actions
//! and responses are `Key: Value\r\n` blocks terminated by a blank line.
//! This client opens one short-lived connection per lookup — login,
//! send `Action: Getvar`, read the response, disconnect — mirroring the
//! bridge's `transport_tcp.rs` connect/read/disconnect shape applied to
//! a line-oriented protocol instead of a length-prefixed binary one.
//! A successful `Getvar` yields a `Value`; timeouts and missing
//! variables are treated as "unknown caller" (§6).

use std::time::Duration;
use tokio::io::{ AsyncBufReadExt, AsyncWriteExt, BufReader };
use tokio::net::TcpStream;
use tracing::{ debug, warn };

const DEFAULT_DEADLINE: Duration = Duration::from_secs(3);

/// Look up `CALLER_<uniqueid>` via AMI `Getvar`. Returns `None` on any
/// failure (connect, auth, timeout, or missing variable) — callers treat
/// that uniformly as "unknown caller".
pub async fn lookup_caller_number(host: &str, port: u16, username: &str, secret: &str, uniqueid: &str) -> Option<
    String
> {
    match tokio::time::timeout(DEFAULT_DEADLINE, do_lookup(host, port, username, secret, uniqueid)).await {
        Ok(Ok(Some(value))) => Some(value),
        Ok(Ok(None)) => {
            debug!(uniqueid = %uniqueid, "ami getvar returned no value");
            None
        }
        Ok(Err(e)) => {
            warn!(error = %e, "ami lookup failed");
            None
        }
        Err(_) => {
            warn!(uniqueid = %uniqueid, "ami lookup timed out");
            None
        }
    }
}

async fn do_lookup(
    host: &str,
    port: u16,
    username: &str,
    secret: &str,
    uniqueid: &str
) -> anyhow::Result<Option<String>> {
    let stream = TcpStream::connect((host, port)).await?;
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    // Banner line ("Asterisk Call Manager/x.y.z"), not itself a block.
    let mut banner = String::new();
    reader.read_line(&mut banner).await?;

    send_action(
        &mut write_half,
        &[("Action", "Login"), ("Username", username), ("Secret", secret), ("Events", "off")]
    ).await?;
    let login_response = read_block(&mut reader).await?;
    if login_response.get("Response").map(String::as_str) != Some("Success") {
        anyhow::bail!("ami login failed: {:?}", login_response.get("Message"));
    }

    let variable = format!("CALLER_{uniqueid}");
    send_action(&mut write_half, &[("Action", "Getvar"), ("Variable", &variable)]).await?;
    let getvar_response = read_block(&mut reader).await?;

    send_action(&mut write_half, &[("Action", "Logoff")]).await?;

    if getvar_response.get("Response").map(String::as_str) != Some("Success") {
        return Ok(None);
    }
    Ok(getvar_response.get("Value").cloned().filter(|v| !v.is_empty()))
}

async fn send_action(write_half: &mut (impl AsyncWriteExt + Unpin), fields: &[(&str, &str)]) -> anyhow::Result<()> {
    let mut out = String::new();
    for (key, value) in fields {
        out.push_str(key);
        out.push_str(": ");
        out.push_str(value);
        out.push_str("\r\n");
    }
    out.push_str("\r\n");
    write_half.write_all(out.as_bytes()).await?;
    Ok(())
}

/// Read one `Key: Value\r\n` block up to the terminating blank line.
async fn read_block(reader: &mut (impl AsyncBufReadExt + Unpin)) -> anyhow::Result<std::collections::HashMap<String, String>> {
    let mut fields = std::collections::HashMap::new();
    loop {
        let mut line = String::new();
        let n = reader.read_line(&mut line).await?;
        if n == 0 {
            anyhow::bail!("ami connection closed mid-response");
        }
        let trimmed = line.trim_end_matches(['\r', '\n']);
        if trimmed.is_empty() {
            break;
        }
        if let Some((key, value)) = trimmed.split_once(':') {
            fields.insert(key.trim().to_string(), value.trim().to_string());
        }
    }
    Ok(fields)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_block_like_lines() {
        // Exercises the same key:value split `read_block` uses, without
        // needing a live socket.
        let lines = ["Response: Success\r\n", "Value: 0612345678\r\n", "\r\n"];
        let mut fields = std::collections::HashMap::new();
        for line in lines {
            let trimmed = line.trim_end_matches(['\r', '\n']);
            if trimmed.is_empty() {
                break;
            }
            if let Some((k, v)) = trimmed.split_once(':') {
                fields.insert(k.trim().to_string(), v.trim().to_string());
            }
        }
        assert_eq!(fields.get("Response").map(String::as_str), Some("Success"));
        assert_eq!(fields.get("Value").map(String::as_str), Some("0612345678"));
    }

    #[tokio::test]
    async fn test_unreachable_host_yields_none() {
        // Port 0 never accepts a connection; the caller must see `None`,
        // never a panic or propagated error.
        let result = lookup_caller_number("127.0.0.1", 0, "u", "s", "abc-123").await;
        assert!(result.is_none());
    }
}
