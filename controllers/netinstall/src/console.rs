//! Operator console.
//!
//! Line-based menu on stdin. Typing `i` lists every discovered device twice:
//! once to save its key, and once per compatible image to install. Entering
//! the number of an entry runs it; anything else closes the menu.

use crate::error::ControllerError;
use netinstall_server::{MacAddr, OperatorHandle};
use std::fmt::Write as _;
use std::io::{BufRead, Write as _};
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

/// What a menu entry does
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MenuChoice {
    ExportKey(MacAddr),
    SendImage { mac: MacAddr, image: String },
}

/// A rendered menu and the entries its numbers refer to
#[derive(Debug)]
pub struct Menu {
    pub text: String,
    pub choices: Vec<MenuChoice>,
}

impl Menu {
    /// The entry for a 1-based number typed by the operator.
    pub fn select(&self, input: &str) -> Option<&MenuChoice> {
        let n: usize = input.trim().parse().ok()?;
        self.choices.get(n.checked_sub(1)?)
    }
}

/// Build the menu from the current sessions and catalog.
pub async fn build_menu(operator: &OperatorHandle) -> Result<Menu, ControllerError> {
    let sessions = operator.list_sessions().await?;
    let mut text = String::new();
    let mut choices = Vec::new();

    if sessions.is_empty() {
        text.push_str("\n No devices discovered yet\n");
        return Ok(Menu { text, choices });
    }

    text.push_str("\n Save key file for device:\n");
    for session in &sessions {
        choices.push(MenuChoice::ExportKey(session.mac));
        let _ = writeln!(
            text,
            "    {}: {} ({}) {}",
            choices.len(),
            session.name,
            session.arch,
            session.mac
        );
    }

    text.push_str("\n Send npk file to device:\n");
    for session in &sessions {
        let _ = writeln!(text, "     {} ({}) {}:", session.name, session.arch, session.mac);
        let images = operator.list_images(Some(session.arch.clone())).await?;
        if images.is_empty() {
            text.push_str("         No npk files found for the device\n");
        }
        for image in images {
            choices.push(MenuChoice::SendImage {
                mac: session.mac,
                image: image.filename.clone(),
            });
            let _ = writeln!(
                text,
                "         {}: {} | {} | {} | {} | {}",
                choices.len(),
                image.filename,
                image.arch,
                image.version,
                image.channel,
                image.name
            );
        }
    }

    text.push_str("\n Enter a number, or anything else to close the menu: ");
    Ok(Menu { text, choices })
}

async fn execute(operator: &OperatorHandle, choice: &MenuChoice) {
    match choice {
        MenuChoice::ExportKey(mac) => match operator.export_key(*mac).await {
            Ok(path) => info!("Key was saved to \"{}\"", path.display()),
            Err(e) => error!("Could not save key for {}: {}", mac, e),
        },
        MenuChoice::SendImage { mac, image } => {
            match operator.start_transfer(*mac, image.clone()).await {
                Ok(_) => info!("Waiting for {} to accept \"{}\"", mac, image),
                Err(e) => error!("Could not send \"{}\" to {}: {}", image, mac, e),
            }
        }
    }
}

/// Read stdin on a plain thread so a pending read never holds up runtime shutdown.
fn spawn_stdin_reader() -> mpsc::Receiver<String> {
    let (tx, rx) = mpsc::channel(16);
    std::thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            let Ok(line) = line else { break };
            if tx.blocking_send(line).is_err() {
                break;
            }
        }
    });
    rx
}

/// Run the console until shutdown or end of input.
pub async fn run_console(operator: OperatorHandle, mut shutdown: watch::Receiver<bool>) {
    let mut lines = spawn_stdin_reader();
    let mut menu: Option<Menu> = None;

    loop {
        tokio::select! {
            line = lines.recv() => {
                let Some(line) = line else {
                    info!("Console input closed");
                    break;
                };
                let line = line.trim();
                match menu.take() {
                    Some(open) => match open.select(line) {
                        Some(choice) => execute(&operator, choice).await,
                        None => info!("Menu closed"),
                    },
                    None if line == "i" => match build_menu(&operator).await {
                        Ok(built) => {
                            print!("{}", built.text);
                            let _ = std::io::stdout().flush();
                            if !built.choices.is_empty() {
                                menu = Some(built);
                            }
                        }
                        Err(e) => warn!("Could not build menu: {}", e),
                    },
                    None => {}
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}
