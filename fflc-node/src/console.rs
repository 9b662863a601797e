//! Line console on stdin: drives the node API by hand.

use fflc_core::{ChatId, EventBody, PeerId};
use fflc_node::{Inbound, Node};
use tokio::io::{AsyncBufReadExt, BufReader};

const HELP: &str = "\
commands:
  /add <name> <pubkey-hex> <host:port>   add a contact
  /msg <name> <text>                     send a direct message
  /chat <chat> <name:weight>...          create a chat
  /say <chat> <text>                     propose a text event
  /sync <chat> <name>                    replace a chat log with a peer's
  /log <chat>                            print a chat log
  /id                                    show this node's id and key
  /quit                                  exit";

#[derive(Debug, PartialEq, Eq)]
enum Command {
    Add { name: String, key: String, address: String },
    Msg { to: String, text: String },
    Chat { chat: String, participants: Vec<(String, u32)> },
    Say { chat: String, text: String },
    Sync { chat: String, peer: String },
    Log { chat: String },
    Id,
    Help,
    Quit,
}

fn parse(line: &str) -> Result<Command, String> {
    let line = line.trim();
    let (cmd, rest) = line.split_once(' ').unwrap_or((line, ""));
    let rest = rest.trim();
    let words: Vec<&str> = rest.split_whitespace().collect();
    let usage = |u: &str| Err(format!("usage: {u}"));
    match cmd {
        "/add" => match words.as_slice() {
            [name, key, address] => Ok(Command::Add {
                name: name.to_string(),
                key: key.to_string(),
                address: address.to_string(),
            }),
            _ => usage("/add <name> <pubkey-hex> <host:port>"),
        },
        "/msg" | "/say" => match rest.split_once(' ') {
            Some((target, text)) if !text.trim().is_empty() => {
                let (target, text) = (target.to_string(), text.trim().to_string());
                Ok(if cmd == "/msg" {
                    Command::Msg { to: target, text }
                } else {
                    Command::Say { chat: target, text }
                })
            }
            _ => usage(&format!("{cmd} <target> <text>")),
        },
        "/chat" => {
            let Some((chat, members)) = words.split_first() else {
                return usage("/chat <chat> <name:weight>...");
            };
            let participants = members
                .iter()
                .map(|m| -> Result<(String, u32), String> {
                    let (name, weight) = m
                        .split_once(':')
                        .ok_or_else(|| format!("expected name:weight, got {m}"))?;
                    let weight = weight
                        .parse::<u32>()
                        .map_err(|_| format!("bad weight in {m}"))?;
                    Ok((name.to_string(), weight))
                })
                .collect::<Result<Vec<_>, String>>()?;
            if participants.is_empty() {
                return usage("/chat <chat> <name:weight>...");
            }
            Ok(Command::Chat {
                chat: chat.to_string(),
                participants,
            })
        }
        "/sync" => match words.as_slice() {
            [chat, peer] => Ok(Command::Sync {
                chat: chat.to_string(),
                peer: peer.to_string(),
            }),
            _ => usage("/sync <chat> <name>"),
        },
        "/log" => match words.as_slice() {
            [chat] => Ok(Command::Log {
                chat: chat.to_string(),
            }),
            _ => usage("/log <chat>"),
        },
        "/id" => Ok(Command::Id),
        "/help" | "/h" => Ok(Command::Help),
        "/quit" | "/q" => Ok(Command::Quit),
        other => Err(format!("unknown command: {other} (try /help)")),
    }
}

async fn execute(node: &Node, command: Command) -> anyhow::Result<bool> {
    match command {
        Command::Add { name, key, address } => {
            let id = node.add_contact(&name, &key, &address)?;
            println!("contact {id} added");
        }
        Command::Msg { to, text } => {
            node.send_message(&PeerId::new(to)?, &text).await?;
        }
        Command::Chat { chat, participants } => {
            let participants = participants
                .into_iter()
                .map(|(name, weight)| -> anyhow::Result<(PeerId, u32)> {
                    Ok((PeerId::new(name)?, weight))
                })
                .collect::<anyhow::Result<Vec<_>>>()?;
            node.create_chat(ChatId::new(chat)?, participants).await?;
        }
        Command::Say { chat, text } => {
            let event = node.post_text(&ChatId::new(chat)?, &text).await?;
            println!("proposed for {}", event.timestamp);
        }
        Command::Sync { chat, peer } => {
            let n = node
                .request_sync(&ChatId::new(chat)?, &PeerId::new(peer)?)
                .await?;
            println!("{n} events replayed");
        }
        Command::Log { chat } => match node.chat_log(&ChatId::new(chat.as_str())?).await {
            Some(events) => {
                for (i, event) in events.iter().enumerate() {
                    println!("{i:>4} {} {}", event.initiator, describe(&event.body));
                }
            }
            None => println!("no chat {chat}"),
        },
        Command::Id => println!("{} {}", node.local_id(), node.public_key()),
        Command::Help => println!("{HELP}"),
        Command::Quit => return Ok(false),
    }
    Ok(true)
}

fn describe(body: &EventBody) -> String {
    match body {
        EventBody::Text { text } => text.clone(),
        EventBody::NewUser { new_user_id } => format!("[joined: {new_user_id}]"),
        EventBody::Transfer { amount, recipient } => format!("[transfer {amount} to {recipient}]"),
    }
}

pub fn print_inbound(message: &Inbound) {
    match message {
        Inbound::DirectMessage { from, text } => println!("<{from}> {text}"),
        Inbound::ChatCommitted { chat_id, event } => {
            println!("#{chat_id} <{}> {}", event.initiator, describe(&event.body))
        }
    }
}

/// Read commands until EOF or `/quit`.
pub async fn run(node: &Node) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        match parse(&line) {
            Ok(command) => match execute(node, command).await {
                Ok(true) => {}
                Ok(false) => break,
                Err(e) => eprintln!("error: {e}"),
            },
            Err(e) => eprintln!("{e}"),
        }
    }
    Ok(())
}
