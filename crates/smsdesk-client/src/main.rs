use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand, ValueEnum};
use smsdesk::client::ApiClient;
use smsdesk::protocol::{Category, Contact, Direction, Message, SendRequest, UpdateContactRequest};
use smsdesk_client::controller::RealtimeStatus;
use smsdesk_client::overlay::is_temp_id;
use smsdesk_client::realtime::{
    ChannelConnector, RealtimeOptions, SocketConnector, spawn_subscriber,
};
use smsdesk_client::state_dir::default_state_dir;
use smsdesk_client::{Command, Controller, ControllerConfig, Notice, Phase, ViewState};
use std::collections::HashSet;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

#[derive(Parser)]
#[command(name = "smsdesk", about = "smsdesk conversation client")]
struct Cli {
    /// Server base URL.
    #[arg(long, global = true, env = "SMSDESK_SERVER", default_value = "http://127.0.0.1:8080")]
    server: String,

    /// Bearer token.
    #[arg(long, global = true, env = "SMSDESK_TOKEN", hide_env_values = true)]
    token: Option<String>,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Interactive session with live updates.
    Watch {
        /// Phone number id to start on.
        #[arg(long)]
        phone: Option<String>,
        /// Real-time transport (must match the server).
        #[arg(long, value_enum, default_value_t = Transport::Socket)]
        transport: Transport,
        /// Seconds between polls.
        #[arg(long, default_value_t = 5)]
        poll_secs: u64,
    },
    /// List accessible phone numbers.
    Numbers,
    /// List contacts of a phone number.
    Contacts {
        /// Phone number id (defaults to the first accessible number).
        #[arg(long)]
        phone: Option<String>,
    },
    /// Send one message.
    Send {
        /// Recipient, E.164.
        to: String,
        /// Message body.
        body: String,
        /// Phone number id to send from (defaults to the first accessible number).
        #[arg(long)]
        phone: Option<String>,
    },
    /// Check server health.
    Health,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Transport {
    Socket,
    Channel,
    /// Polling only.
    None,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "smsdesk=warn,smsdesk_client=warn".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let token = cli
        .token
        .clone()
        .context("a token is required (--token or SMSDESK_TOKEN)")?;
    let api = ApiClient::new(&cli.server, &token)?;

    match cli.command {
        Cmd::Watch {
            phone,
            transport,
            poll_secs,
        } => watch(api, phone, transport, Duration::from_secs(poll_secs.max(1))).await,
        Cmd::Numbers => {
            for number in api.phone_numbers().await? {
                let state = if number.active { "" } else { " (inactive)" };
                println!("{}  {}{state}", number.id, number.phone_number);
            }
            Ok(())
        }
        Cmd::Contacts { phone } => {
            let phone_id = resolve_phone(&api, phone).await?;
            for (i, contact) in api.contacts(&phone_id).await?.iter().enumerate() {
                println!("{}", contact_line(i, contact));
            }
            Ok(())
        }
        Cmd::Send { to, body, phone } => {
            let phone_number_id = resolve_phone(&api, phone).await?;
            let message = api
                .send(&SendRequest {
                    to,
                    body,
                    phone_number_id,
                })
                .await?;
            println!("sent {} at {}", message.id, message.timestamp.to_rfc3339());
            Ok(())
        }
        Cmd::Health => {
            let health = api.health().await?;
            println!(
                "{} (transport: {})",
                if health.healthy { "healthy" } else { "unhealthy" },
                health.transport
            );
            Ok(())
        }
    }
}

async fn resolve_phone(api: &ApiClient, requested: Option<String>) -> Result<String> {
    if let Some(id) = requested {
        return Ok(id);
    }
    let numbers = api.phone_numbers().await?;
    match numbers.into_iter().next() {
        Some(number) => Ok(number.id),
        None => bail!("no phone number is assigned to this account"),
    }
}

async fn watch(
    api: ApiClient,
    phone: Option<String>,
    transport: Transport,
    poll_interval: Duration,
) -> Result<()> {
    let config = ControllerConfig {
        poll_interval,
        state_dir: default_state_dir().ok(),
        ..Default::default()
    };
    let (notice_tx, mut notice_rx) = mpsc::unbounded_channel();
    let controller = Controller::new(api.clone(), config, notice_tx);
    let mut view = controller.watch_view();
    let interests = controller.watch_interests();

    let (signal_tx, signal_rx) = mpsc::unbounded_channel();
    let options = RealtimeOptions::default();
    let subscriber = match transport {
        Transport::Socket => Some(spawn_subscriber(
            SocketConnector::new(api.base_url(), api.token()),
            interests,
            options,
            signal_tx,
        )),
        Transport::Channel => {
            let connector =
                ChannelConnector::new(api.base_url(), api.token(), options.connect_timeout)?;
            Some(spawn_subscriber(connector, interests, options, signal_tx))
        }
        Transport::None => None,
    };

    let (cmd_tx, cmd_rx) = mpsc::channel(32);
    let controller_task = tokio::spawn(controller.run(cmd_rx, signal_rx));
    cmd_tx
        .send(Command::Initialize {
            phone_number_id: phone,
        })
        .await
        .context("controller stopped")?;

    let mut shown = Shown::default();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            notice = notice_rx.recv() => {
                let Some(notice) = notice else {
                    break;
                };
                print_notice(&notice, &view.borrow());
            }
            changed = view.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = view.borrow_and_update().clone();
                shown.render(&snapshot);
            }
            line = lines.next_line() => {
                let Some(line) = line? else {
                    break;
                };
                let snapshot = view.borrow().clone();
                match parse_input(&line, &snapshot) {
                    Input::Nothing => {}
                    Input::Quit => break,
                    Input::Help => print_help(),
                    Input::ListContacts => {
                        for (i, contact) in snapshot.contacts.iter().enumerate() {
                            println!("{}", contact_line(i, contact));
                        }
                    }
                    Input::ListNumbers => {
                        for number in &snapshot.phone_numbers {
                            let marker = if snapshot.active_phone.as_ref() == Some(number) { "*" } else { " " };
                            println!("{marker} {}  {}", number.id, number.phone_number);
                        }
                    }
                    Input::Invalid(reason) => eprintln!("{reason}"),
                    Input::Command(cmd) => {
                        if cmd_tx.send(cmd).await.is_err() {
                            break;
                        }
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    drop(cmd_tx);
    if let Some(handle) = subscriber {
        handle.abort();
    }
    controller_task.await.context("controller task panicked")?;
    Ok(())
}

/// What to print when the view changes.
#[derive(Default)]
struct Shown {
    contact: Option<String>,
    messages: HashSet<String>,
}

impl Shown {
    fn render(&mut self, view: &ViewState) {
        if self.contact != view.selected {
            self.contact = view.selected.clone();
            self.messages.clear();
            if let Some(contact) = view.selected_contact() {
                println!("--- {} ({}) ---", contact.display_name(), contact.phone_number);
            }
        }
        for message in &view.messages {
            if is_temp_id(&message.id) || !self.messages.insert(message.id.clone()) {
                continue;
            }
            println!("{}", message_line(message));
        }
    }
}

fn print_notice(notice: &Notice, view: &ViewState) {
    match notice {
        Notice::Ready { phone_number } => {
            let who = view.user.as_ref().map(|u| u.name.as_str()).unwrap_or("?");
            println!(
                "{who} on {} with {} contacts. Type /help for commands.",
                phone_number.phone_number,
                view.contacts.len()
            );
        }
        Notice::NewUnread { contact, added } => {
            println!("* {added} new from {}", contact.display_name());
        }
        Notice::Sent { .. } => {}
        Notice::ContactSaved { contact } => println!("saved {}", contact.display_name()),
        Notice::ContactDeleted { contact_id } => println!("deleted {contact_id}"),
        Notice::Realtime(RealtimeStatus::Live) => tracing::info!("live updates connected"),
        Notice::Realtime(RealtimeStatus::Degraded) => {
            eprintln!("live updates unavailable, polling only")
        }
        Notice::Realtime(RealtimeStatus::Offline) => {}
        Notice::Error(err) => {
            if matches!(view.phase, Phase::Failed(_)) {
                eprintln!("{err} (type /retry)");
            } else {
                eprintln!("{err}");
            }
        }
    }
}

fn print_help() {
    println!(
        "\
/contacts                 list contacts
/open <n|id|number>       open a conversation
/close                    close the conversation
/numbers                  list phone numbers
/phone <id>               switch phone number
/new <number> [name]      add a contact
/rename <contact> <name>  rename a contact
/pin <contact>            pin (or /unpin)
/category <contact> <general|sales>
/delete <contact>         delete a contact and its messages
/refresh                  re-fetch now
/retry                    retry initialization
/quit
anything else is sent to the open conversation"
    );
}

fn contact_line(index: usize, contact: &Contact) -> String {
    let pin = if contact.is_pinned { "^" } else { " " };
    let unread = if contact.unread_count > 0 {
        format!(" [{}]", contact.unread_count)
    } else {
        String::new()
    };
    let last = contact.last_message.as_deref().unwrap_or("");
    format!(
        "{pin}{:>3}. {}{unread}  {last}",
        index + 1,
        contact.display_name()
    )
}

fn message_line(message: &Message) -> String {
    let arrow = match message.direction {
        Direction::Inbound => "<",
        Direction::Outbound => ">",
    };
    format!(
        "{} {arrow} {}",
        message.timestamp.format("%H:%M"),
        message.body
    )
}

#[derive(Debug)]
enum Input {
    Nothing,
    Quit,
    Help,
    ListContacts,
    ListNumbers,
    Invalid(String),
    Command(Command),
}

fn parse_input(line: &str, view: &ViewState) -> Input {
    let line = line.trim_end_matches(['\r', '\n']);
    if line.trim().is_empty() {
        return Input::Nothing;
    }
    let Some(rest) = line.strip_prefix('/') else {
        return Input::Command(Command::Send(line.to_string()));
    };
    let mut parts = rest.splitn(2, char::is_whitespace);
    let verb = parts.next().unwrap_or("");
    let args = parts.next().unwrap_or("").trim();

    let with_contact = |f: &dyn Fn(String, &str) -> Input| -> Input {
        let (target, tail) = args.split_once(char::is_whitespace).unwrap_or((args, ""));
        match find_contact(view, target) {
            Some(contact) => f(contact.id.clone(), tail.trim()),
            None => Input::Invalid(format!("no contact matches {target:?}")),
        }
    };
    let patch = |contact_id: String, patch: UpdateContactRequest| {
        Input::Command(Command::UpdateContact { contact_id, patch })
    };

    match verb {
        "q" | "quit" | "exit" => Input::Quit,
        "help" | "h" => Input::Help,
        "contacts" | "c" => Input::ListContacts,
        "numbers" => Input::ListNumbers,
        "refresh" => Input::Command(Command::Refresh),
        "retry" => Input::Command(Command::Initialize {
            phone_number_id: None,
        }),
        "close" => Input::Command(Command::ClearSelection),
        "open" | "o" => with_contact(&|id, _| Input::Command(Command::SelectContact(id))),
        "delete" => with_contact(&|id, _| Input::Command(Command::DeleteContact(id))),
        "pin" | "unpin" => with_contact(&|id, _| {
            patch(
                id,
                UpdateContactRequest {
                    is_pinned: Some(verb == "pin"),
                    ..Default::default()
                },
            )
        }),
        "rename" => with_contact(&|id, name| {
            patch(
                id,
                UpdateContactRequest {
                    name: Some(name.to_string()),
                    ..Default::default()
                },
            )
        }),
        "category" => with_contact(&|id, raw| match raw.parse::<Category>() {
            Ok(category) => patch(
                id,
                UpdateContactRequest {
                    category: Some(category),
                    ..Default::default()
                },
            ),
            Err(e) => Input::Invalid(e),
        }),
        "phone" => {
            if args.is_empty() {
                return Input::Invalid("usage: /phone <id>".into());
            }
            let id = view
                .phone_numbers
                .iter()
                .find(|p| p.id == args || p.phone_number == args)
                .map(|p| p.id.clone())
                .unwrap_or_else(|| args.to_string());
            Input::Command(Command::SwitchPhone(id))
        }
        "new" => {
            let (number, name) = args.split_once(char::is_whitespace).unwrap_or((args, ""));
            if number.is_empty() {
                return Input::Invalid("usage: /new <number> [name]".into());
            }
            let name = name.trim();
            Input::Command(Command::CreateContact {
                phone_number: number.to_string(),
                name: (!name.is_empty()).then(|| name.to_string()),
            })
        }
        other => Input::Invalid(format!("unknown command /{other}, try /help")),
    }
}

/// 1-based list position, contact id, or counterpart number.
fn find_contact<'a>(view: &'a ViewState, target: &str) -> Option<&'a Contact> {
    if target.is_empty() {
        return None;
    }
    if let Ok(n) = target.parse::<usize>()
        && n >= 1
        && let Some(contact) = view.contacts.get(n - 1)
    {
        return Some(contact);
    }
    view.contacts
        .iter()
        .find(|c| c.id == target || c.phone_number == target)
}
