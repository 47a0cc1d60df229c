//! Serve command - run vault sessions driven by line commands on stdin
//!
//! Each line names an action and a user. Users are given either as a UUID
//! or as a name, which maps to a stable name-based UUID.

use crate::autosave::AutoSaver;
use crate::cache::RecordCache;
use crate::cli::args::ServeArgs;
use crate::config::schema::BackendKind;
use crate::config::Config;
use crate::error::{VaultError, VaultResult};
use crate::metrics::Metrics;
use crate::session::{CloseOutcome, SessionCoordinator};
use crate::storage::{create_backend, Persister, VaultBackend};
use crate::ui::{self, ConsoleRenderer};
use crate::vault::{ItemBlob, VaultMode};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info};
use uuid::Uuid;

const HELP: &str = "\
commands:
  join <user>                 warm the cache for an arriving user
  open <user> [page]          open a vault page (default 1)
  put <user> <slot> <item>    place an item in a slot of the open page
  clear <user> <slot>         empty a slot of the open page
  nav <user> <page>           switch the open vault to another page
  next <user> | prev <user>   page through the open vault
  close <user>                close the vault and save it
  quit <user>                 user leaves; close and save
  slots <user> <n>            set a slot override (0 clears)
  pages <user> <n>            set a page override (0 clears)
  show <user>                 print the open page
  flush                       save every dirty vault now
  stats                       cache and timing statistics
  exit                        shut down";

/// One parsed stdin command
#[derive(Debug, Clone, PartialEq, Eq)]
enum Request {
    Join(Uuid),
    Open(Uuid, u32),
    Put { user: Uuid, slot: usize, item: String },
    Clear { user: Uuid, slot: usize },
    Nav(Uuid, u32),
    Next(Uuid),
    Prev(Uuid),
    Close(Uuid),
    Quit(Uuid),
    Slots(Uuid, u32),
    Pages(Uuid, u32),
    Show(Uuid),
    Flush,
    Stats,
    Help,
    Exit,
}

/// Whether the loop keeps reading
#[derive(Debug, PartialEq, Eq)]
enum Flow {
    Continue,
    Exit,
}

/// Execute the serve command
pub async fn execute(args: ServeArgs, config: &Config) -> VaultResult<()> {
    let config = apply_overrides(args, config);
    let mode = VaultMode::from_config(&config.vault);

    let backend = create_backend(&config, mode.page_width());
    backend.initialize().await?;

    let cache = Arc::new(RecordCache::new(config.cache.warn_threshold));
    let persister = Arc::new(
        Persister::new(Arc::clone(&backend), cache).with_metrics(Arc::new(Metrics::new())),
    );
    let renderer = Arc::new(ConsoleRenderer::new());
    let coordinator = SessionCoordinator::new(Arc::clone(&persister), mode, renderer.clone());
    let mut requests = coordinator
        .take_navigation_requests()
        .ok_or_else(|| VaultError::Internal("navigation requests already taken".to_string()))?;

    let timeout = Duration::from_secs(config.autosave.timeout_secs);
    let mut autosaver = AutoSaver::spawn(
        Arc::clone(&persister),
        Duration::from_secs(config.autosave.interval_secs),
        timeout,
    );

    ui::step_ok_detail(
        "Serving vaults",
        &format!("{} backend, {} mode", backend.name(), mode.name()),
    );

    let host = Host {
        coordinator,
        renderer,
        persister,
        backend,
        timeout,
    };

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let interrupt = tokio::signal::ctrl_c();
    tokio::pin!(interrupt);

    loop {
        tokio::select! {
            biased;
            Some(request) = requests.recv() => host.navigate(request.user, request.target),
            line = lines.next_line() => {
                let line = line.map_err(|e| VaultError::io("reading commands from stdin", e))?;
                let Some(line) = line else {
                    debug!("stdin closed");
                    break;
                };
                if host.handle_line(&line).await == Flow::Exit {
                    break;
                }
                // Apply page changes the command asked for before reading on
                while let Ok(request) = requests.try_recv() {
                    host.navigate(request.user, request.target);
                }
            }
            _ = &mut interrupt => {
                info!("Interrupted, shutting down");
                break;
            }
        }
    }

    host.shutdown(&mut autosaver).await
}

fn apply_overrides(args: ServeArgs, config: &Config) -> Config {
    let mut config = config.clone();
    if let Some(dir) = args.data_dir {
        config.general.data_dir = Some(dir);
    }
    if let Some(backend) = args.backend {
        config.storage.backend = backend;
    }
    config
}

struct Host {
    coordinator: SessionCoordinator,
    renderer: Arc<ConsoleRenderer>,
    persister: Arc<Persister>,
    backend: Arc<dyn VaultBackend>,
    timeout: Duration,
}

impl Host {
    async fn handle_line(&self, line: &str) -> Flow {
        match parse_request(line) {
            Ok(None) => Flow::Continue,
            Ok(Some(Request::Exit)) => Flow::Exit,
            Ok(Some(request)) => {
                if let Err(e) = self.dispatch(request).await {
                    ui::step_error(&e.to_string());
                }
                Flow::Continue
            }
            Err(e) => {
                ui::step_error(&e.to_string());
                Flow::Continue
            }
        }
    }

    async fn dispatch(&self, request: Request) -> VaultResult<()> {
        match request {
            Request::Join(user) => {
                self.coordinator.preload(user).await;
                ui::step_ok(&format!("{} joined", user));
            }
            Request::Open(user, page) => {
                self.coordinator.open_session(user, page).await?;
            }
            Request::Put { user, slot, item } => {
                self.write_slot(user, slot, Some(ItemBlob::new(item)))?;
            }
            Request::Clear { user, slot } => self.write_slot(user, slot, None)?,
            Request::Nav(user, page) => {
                self.coordinator.navigate(user, page)?;
            }
            Request::Next(user) => self.page_through(user, true)?,
            Request::Prev(user) => self.page_through(user, false)?,
            Request::Close(user) => {
                let outcome = self.coordinator.close_session(user).await;
                report_close(user, outcome);
            }
            Request::Quit(user) => {
                let outcome = self.coordinator.disconnect(user).await;
                report_close(user, outcome);
                ui::step_ok(&format!("{} left", user));
            }
            Request::Slots(user, slots) => {
                let outcome = self.coordinator.set_custom_slots(user, slots).await?;
                ui::step_ok_detail(
                    &format!("slot override for {} set to {}", user, slots),
                    &format!("{:?}", outcome),
                );
            }
            Request::Pages(user, pages) => {
                let outcome = self.coordinator.set_custom_pages(user, pages).await?;
                ui::step_ok_detail(
                    &format!("page override for {} set to {}", user, pages),
                    &format!("{:?}", outcome),
                );
            }
            Request::Show(user) => match self.coordinator.current_page_view(user) {
                Some(view) => println!("{}", ui::format_page(&view)),
                None => ui::step_warn(&format!(
                    "no open vault for {} (session {})",
                    user,
                    self.coordinator.session_state(user)
                )),
            },
            Request::Flush => {
                let dirty = self.persister.cache().dirty_users();
                let report = self.persister.save_all(dirty, self.timeout).await;
                let evicted = self.coordinator.evict_idle();
                ui::step_ok_detail(
                    &format!("flushed {} of {} vault(s)", report.succeeded, report.attempted),
                    &format!("{} failed, {} evicted", report.failed, evicted),
                );
            }
            Request::Stats => self.print_stats(),
            Request::Help => println!("{}", HELP),
            Request::Exit => {}
        }
        Ok(())
    }

    /// Change one slot of the open page through the slot snapshot path
    fn write_slot(&self, user: Uuid, slot: usize, item: Option<ItemBlob>) -> VaultResult<()> {
        let view = self
            .coordinator
            .current_page_view(user)
            .ok_or(VaultError::SessionNotOpen(user))?;
        let index = slot
            .checked_sub(1)
            .filter(|i| *i < view.slots.len())
            .ok_or_else(|| {
                VaultError::User(format!("slot {} is out of range (1..={})", slot, view.slots.len()))
            })?;
        if view.is_locked(index) {
            return Err(VaultError::User(format!("slot {} is locked", slot)));
        }

        let mut slots = view.slots;
        slots[index] = item;
        self.coordinator.apply_slot_snapshot(user, view.page, &slots)
    }

    /// Ask the user's surface to turn the page; the request comes back
    /// through the navigation channel
    fn page_through(&self, user: Uuid, forward: bool) -> VaultResult<()> {
        let navigator = self
            .renderer
            .navigator(user)
            .ok_or(VaultError::SessionNotOpen(user))?;
        let sent = if forward {
            navigator.next()
        } else {
            navigator.previous()
        };
        if !sent {
            ui::step_warn(&format!("no page in that direction for {}", user));
        }
        Ok(())
    }

    fn navigate(&self, user: Uuid, target: u32) {
        if let Err(e) = self.coordinator.navigate(user, target) {
            ui::step_error(&e.to_string());
        }
    }

    fn print_stats(&self) {
        ui::section("Vaults");
        ui::key_value("backend", self.backend.name());
        ui::key_value("mode", self.coordinator.mode().name());
        ui::key_value("cache", &self.persister.cache().stats().to_string());
        ui::key_value(
            "sessions",
            &self.coordinator.open_sessions().len().to_string(),
        );

        let timings = self.persister.metrics().snapshot();
        if !timings.is_empty() {
            ui::section("Timings");
            for (op, stats) in timings {
                ui::key_value(&op, &stats.to_string());
            }
        }
    }

    /// Close sessions, stop the scheduler, drain dirty records and close storage
    async fn shutdown(self, autosaver: &mut AutoSaver) -> VaultResult<()> {
        let closed = self.coordinator.close_all().await;
        autosaver.stop().await;

        let dirty = self.persister.cache().dirty_users();
        let report = self.persister.save_all(dirty, self.timeout).await;
        self.backend.close().await?;

        if report.is_complete() {
            ui::step_ok_detail(
                "Shut down",
                &format!("{} session(s) closed, {} vault(s) saved", closed, report.succeeded),
            );
        } else {
            ui::step_warn_hint(
                &format!(
                    "Shut down with {} unsaved vault(s)",
                    report.failed + report.abandoned
                ),
                "Check the storage backend and rerun with -v",
            );
        }
        Ok(())
    }
}

fn report_close(user: Uuid, outcome: CloseOutcome) {
    match outcome {
        CloseOutcome::Saved => ui::step_ok(&format!("closed vault for {} (saved)", user)),
        CloseOutcome::Clean | CloseOutcome::Pending => {
            ui::step_ok(&format!("closed vault for {}", user))
        }
        CloseOutcome::SaveFailed => ui::step_warn_hint(
            &format!("closed vault for {} but the save failed", user),
            "It stays queued for the next auto-save",
        ),
        CloseOutcome::Suppressed => {
            ui::step_warn(&format!("vault for {} is changing pages; not closed", user))
        }
        CloseOutcome::NotOpen => debug!("No open vault for {}", user),
    }
}

/// Resolve a user token: a UUID, or a name hashed to a name-based UUID
fn parse_user(token: &str) -> VaultResult<Uuid> {
    if let Ok(id) = Uuid::parse_str(token) {
        if id.is_nil() {
            return Err(VaultError::User("the nil UUID is not a user".to_string()));
        }
        return Ok(id);
    }
    Ok(Uuid::new_v5(&Uuid::NAMESPACE_OID, token.as_bytes()))
}

fn parse_number<T: std::str::FromStr>(token: Option<&str>, what: &str) -> VaultResult<T> {
    let token = token.ok_or_else(|| VaultError::User(format!("missing {}", what)))?;
    token
        .parse()
        .map_err(|_| VaultError::User(format!("invalid {} '{}'", what, token)))
}

/// Parse one line; blank lines and `#` comments yield `None`
fn parse_request(line: &str) -> VaultResult<Option<Request>> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }

    let mut words = line.split_whitespace();
    let Some(command) = words.next() else {
        return Ok(None);
    };

    let request = match command {
        "flush" => Request::Flush,
        "stats" => Request::Stats,
        "help" => Request::Help,
        "exit" => Request::Exit,
        _ => {
            let user = words
                .next()
                .ok_or_else(|| VaultError::User(format!("'{}' needs a user", command)))
                .and_then(parse_user)?;
            match command {
                "join" => Request::Join(user),
                "open" => {
                    let page = match words.next() {
                        Some(page) => parse_number(Some(page), "page")?,
                        None => 1,
                    };
                    Request::Open(user, page)
                }
                "put" => {
                    let slot = parse_number(words.next(), "slot")?;
                    let item = words.collect::<Vec<_>>().join(" ");
                    if item.is_empty() {
                        return Err(VaultError::User("missing item".to_string()));
                    }
                    return Ok(Some(Request::Put { user, slot, item }));
                }
                "clear" => Request::Clear {
                    user,
                    slot: parse_number(words.next(), "slot")?,
                },
                "nav" => Request::Nav(user, parse_number(words.next(), "page")?),
                "next" => Request::Next(user),
                "prev" => Request::Prev(user),
                "close" => Request::Close(user),
                "quit" => Request::Quit(user),
                "slots" => Request::Slots(user, parse_number(words.next(), "slot count")?),
                "pages" => Request::Pages(user, parse_number(words.next(), "page count")?),
                "show" => Request::Show(user),
                other => {
                    return Err(VaultError::User(format!(
                        "unknown command '{}' (try 'help')",
                        other
                    )))
                }
            }
        }
    };

    if let Some(extra) = words.next() {
        return Err(VaultError::User(format!("unexpected argument '{}'", extra)));
    }
    Ok(Some(request))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_map_to_stable_ids() {
        let alice = parse_user("alice").unwrap();
        assert_eq!(alice, parse_user("alice").unwrap());
        assert_ne!(alice, parse_user("bob").unwrap());

        let id = Uuid::new_v4();
        assert_eq!(parse_user(&id.to_string()).unwrap(), id);
        assert!(parse_user(&Uuid::nil().to_string()).is_err());
    }

    #[test]
    fn parses_commands() {
        let alice = parse_user("alice").unwrap();
        assert_eq!(parse_request("open alice").unwrap(), Some(Request::Open(alice, 1)));
        assert_eq!(parse_request("  nav alice 3 ").unwrap(), Some(Request::Nav(alice, 3)));
        assert_eq!(
            parse_request("put alice 4 golden apple").unwrap(),
            Some(Request::Put {
                user: alice,
                slot: 4,
                item: "golden apple".to_string()
            })
        );
        assert_eq!(parse_request("slots alice 0").unwrap(), Some(Request::Slots(alice, 0)));
        assert_eq!(parse_request("exit").unwrap(), Some(Request::Exit));
    }

    #[test]
    fn skips_blank_and_comment_lines() {
        assert_eq!(parse_request("").unwrap(), None);
        assert_eq!(parse_request("   ").unwrap(), None);
        assert_eq!(parse_request("# setup").unwrap(), None);
    }

    #[test]
    fn rejects_malformed_commands() {
        assert!(parse_request("open").is_err());
        assert!(parse_request("nav alice").is_err());
        assert!(parse_request("nav alice two").is_err());
        assert!(parse_request("put alice 3").is_err());
        assert!(parse_request("close alice now").is_err());
        assert!(parse_request("dance alice").is_err());
    }

    #[test]
    fn overrides_replace_storage_settings() {
        let args = ServeArgs {
            data_dir: Some("/srv/vaults".into()),
            backend: Some(BackendKind::Sqlite),
        };
        let config = apply_overrides(args, &Config::default());
        assert_eq!(config.storage.backend, BackendKind::Sqlite);
        assert_eq!(
            config.general.data_dir.as_deref(),
            Some(std::path::Path::new("/srv/vaults"))
        );
    }
}
