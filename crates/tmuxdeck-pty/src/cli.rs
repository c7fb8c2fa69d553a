//! Client commands that talk to a running server.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use crossterm::terminal::{disable_raw_mode, enable_raw_mode};
use futures::{SinkExt, StreamExt};
use reqwest::Client;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use url::Url;

use tmuxdeck_pty::event::SessionEvent;
use tmuxdeck_pty::session::SessionInfo;

/// Ctrl-] detaches, as in telnet.
const DETACH_KEY: u8 = 0x1d;

fn endpoint(server: &str, path: &str) -> Result<Url> {
    let base = Url::parse(server).with_context(|| format!("Invalid server URL: {server}"))?;
    base.join(path)
        .with_context(|| format!("Invalid request path: {path}"))
}

fn ws_endpoint(server: &str, path: &str) -> Result<Url> {
    let mut url = endpoint(server, path)?;
    let scheme = match url.scheme() {
        "https" => "wss",
        _ => "ws",
    };
    url.set_scheme(scheme)
        .map_err(|_| anyhow::anyhow!("Cannot build WebSocket URL from {server}"))?;
    Ok(url)
}

async fn parse_response<T: DeserializeOwned>(response: reqwest::Response) -> Result<T> {
    let status = response.status();
    if !status.is_success() {
        let body: serde_json::Value = response
            .json()
            .await
            .unwrap_or_else(|_| serde_json::json!({ "error": "unknown error" }));
        let error = body
            .get("error")
            .and_then(|e| e.as_str())
            .unwrap_or("unknown error");
        bail!("request failed: {status} - {error}");
    }
    Ok(response.json::<T>().await?)
}

#[derive(serde::Deserialize)]
struct SessionList {
    sessions: Vec<SessionInfo>,
}

pub async fn cmd_list(server: &str, json: bool) -> Result<()> {
    let response = Client::new()
        .get(endpoint(server, "/sessions")?)
        .send()
        .await
        .context("Failed to reach server")?;

    if json {
        let value: serde_json::Value = parse_response(response).await?;
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }

    let list: SessionList = parse_response(response).await?;
    if list.sessions.is_empty() {
        println!("No sessions");
        return Ok(());
    }
    for info in list.sessions {
        println!(
            "{}: {} [{}] {} ({} attached)",
            info.id,
            info.display_name,
            info.status,
            info.working_directory.display(),
            info.subscribers
        );
    }
    Ok(())
}

pub struct StartArgs {
    pub session: String,
    pub cwd: Option<PathBuf>,
    pub command: String,
    pub name: Option<String>,
    pub bypass_permissions: bool,
}

pub async fn cmd_start(server: &str, args: StartArgs) -> Result<()> {
    let cwd = match args.cwd {
        Some(cwd) => cwd,
        None => std::env::current_dir().context("Failed to read current directory")?,
    };
    let (cols, rows) = crossterm::terminal::size().unwrap_or((120, 40));

    let response = Client::new()
        .post(endpoint(server, "/sessions")?)
        .json(&serde_json::json!({
            "sessionId": args.session,
            "workingDirectory": cwd,
            "command": args.command,
            "displayName": args.name,
            "bypassPermissions": args.bypass_permissions,
            "cols": cols,
            "rows": rows,
        }))
        .send()
        .await
        .context("Failed to reach server")?;

    let body: serde_json::Value = parse_response(response).await?;
    println!(
        "{}",
        body.get("sessionId")
            .and_then(|id| id.as_str())
            .unwrap_or(&args.session)
    );
    Ok(())
}

pub async fn cmd_stop(server: &str, sessions: &[String]) -> Result<()> {
    let client = Client::new();
    for session in sessions {
        let response = client
            .delete(endpoint(server, &format!("/sessions/{session}"))?)
            .send()
            .await
            .context("Failed to reach server")?;
        let _: serde_json::Value = parse_response(response)
            .await
            .with_context(|| format!("Failed to stop {session}"))?;
        eprintln!("Stopped {session}");
    }
    Ok(())
}

pub async fn cmd_send(server: &str, session: &str, text: &str, enter: bool) -> Result<()> {
    let data = if enter {
        format!("{text}\r")
    } else {
        text.to_string()
    };
    let response = Client::new()
        .post(endpoint(server, &format!("/sessions/{session}/input"))?)
        .json(&serde_json::json!({ "data": data }))
        .send()
        .await
        .context("Failed to reach server")?;
    let _: serde_json::Value = parse_response(response).await?;
    Ok(())
}

pub async fn cmd_resize(server: &str, session: &str, cols: u16, rows: u16) -> Result<()> {
    let response = Client::new()
        .post(endpoint(server, &format!("/sessions/{session}/resize"))?)
        .json(&serde_json::json!({ "cols": cols, "rows": rows }))
        .send()
        .await
        .context("Failed to reach server")?;
    let _: serde_json::Value = parse_response(response).await?;
    Ok(())
}

struct RawModeGuard;

impl RawModeGuard {
    fn new() -> Result<Self> {
        enable_raw_mode()?;
        Ok(Self)
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        let _ = disable_raw_mode();
    }
}

pub async fn cmd_attach(server: &str, session: &str) -> Result<()> {
    let url = ws_endpoint(server, &format!("/sessions/{session}/ws"))?;
    let (ws_stream, _) = connect_async(url.as_str())
        .await
        .with_context(|| format!("Failed to attach to {session}"))?;
    eprintln!("Attached to {session}. Press Ctrl-] to detach.\r");

    let _guard = RawModeGuard::new()?;
    let (mut write, mut read) = ws_stream.split();

    if let Ok((cols, rows)) = crossterm::terminal::size() {
        let resize = serde_json::json!({ "type": "resize", "cols": cols, "rows": rows });
        write.send(Message::Text(resize.to_string())).await?;
    }

    let mut stdin = tokio::io::stdin();
    let mut stdout = tokio::io::stdout();
    let mut buf = [0u8; 1024];
    let mut exit_code = None;

    #[cfg(unix)]
    let mut sigwinch =
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::window_change())?;

    loop {
        tokio::select! {
            _ = async {
                #[cfg(unix)]
                return sigwinch.recv().await;
                #[cfg(not(unix))]
                std::future::pending::<Option<()>>().await
            } => {
                if let Ok((cols, rows)) = crossterm::terminal::size() {
                    let resize = serde_json::json!({ "type": "resize", "cols": cols, "rows": rows });
                    write.send(Message::Text(resize.to_string())).await?;
                }
            }
            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<SessionEvent>(&text) {
                            Ok(SessionEvent::Output { data, .. }) => {
                                stdout.write_all(&data).await?;
                                stdout.flush().await?;
                            }
                            Ok(SessionEvent::Exit { code }) => {
                                exit_code = Some(code);
                                break;
                            }
                            Ok(SessionEvent::Restarted) => {
                                eprint!("\r\n[session restarted elsewhere]\r\n");
                                break;
                            }
                            Ok(SessionEvent::Status { .. }) | Err(_) => {}
                        }
                    }
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    _ => {}
                }
            }
            res = stdin.read(&mut buf) => {
                match res {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        let input = &buf[..n];
                        if let Some(pos) = input.iter().position(|b| *b == DETACH_KEY) {
                            if pos > 0 {
                                write.send(Message::Binary(input[..pos].to_vec())).await?;
                            }
                            break;
                        }
                        write.send(Message::Binary(input.to_vec())).await?;
                    }
                }
            }
        }
    }

    let _ = write.close().await;
    drop(_guard);
    match exit_code {
        Some(code) => eprintln!("\n[process exited: {:?}]", code),
        None => eprintln!("\n[detached]"),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoints_join_paths() {
        let url = endpoint("http://localhost:39383", "/sessions/p1/input").unwrap();
        assert_eq!(url.as_str(), "http://localhost:39383/sessions/p1/input");
    }

    #[test]
    fn ws_endpoint_switches_scheme() {
        let url = ws_endpoint("https://deck.example.com/", "/sessions/p1/ws").unwrap();
        assert_eq!(url.as_str(), "wss://deck.example.com/sessions/p1/ws");
        let url = ws_endpoint("http://127.0.0.1:39383", "/sessions/p1/ws").unwrap();
        assert_eq!(url.scheme(), "ws");
    }

    #[test]
    fn invalid_server_is_an_error() {
        assert!(endpoint("not a url", "/sessions").is_err());
    }
}
