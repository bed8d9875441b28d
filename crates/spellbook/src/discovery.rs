use crate::error::{Result, SpellError};
use crate::spell::{Spell, SPELL_FILE_SUFFIX};
use notify::{Config as NotifyConfig, Event, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::{Duration, SystemTime};
use tokio::sync::{broadcast, mpsc};
use tokio::time::{sleep_until, Instant};

/// Quiet period between a filesystem event and the re-scan it triggers.
pub const DISCOVERY_DEBOUNCE: Duration = Duration::from_millis(200);

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SpellEvent {
    Added(String),
    Modified(String),
    Removed(String),
}

enum WatcherCommand {
    Rescan,
    Shutdown,
}

/// Live map of the spell directory. Cheap to clone; the last clone
/// dropped shuts the watcher loop down.
#[derive(Clone)]
pub struct SpellDiscovery {
    inner: Arc<DiscoveryInner>,
}

struct DiscoveryInner {
    dir: PathBuf,
    spells: RwLock<HashMap<String, Spell>>,
    event_tx: broadcast::Sender<SpellEvent>,
    command_tx: mpsc::Sender<WatcherCommand>,
    _watcher: std::sync::Mutex<Option<RecommendedWatcher>>,
}

impl SpellDiscovery {
    /// Scan `dir` once, then keep watching it for changes.
    pub fn start(dir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&dir)?;
        let initial = scan_spell_dir(&dir);
        log::info!("discovered {} spell(s) in {}", initial.len(), dir.display());

        let (fs_tx, fs_rx) = mpsc::channel(256);
        let (command_tx, command_rx) = mpsc::channel(16);
        let (event_tx, _) = broadcast::channel(64);

        let mut watcher = RecommendedWatcher::new(
            move |res| {
                let _ = fs_tx.blocking_send(res);
            },
            NotifyConfig::default(),
        )
        .map_err(|e| SpellError::Watcher(format!("watcher init failed: {e}")))?;
        watcher
            .watch(&dir, RecursiveMode::NonRecursive)
            .map_err(|e| SpellError::Watcher(format!("watch {} failed: {e}", dir.display())))?;

        let inner = Arc::new(DiscoveryInner {
            dir,
            spells: RwLock::new(initial),
            event_tx,
            command_tx,
            _watcher: std::sync::Mutex::new(Some(watcher)),
        });
        // The loop holds only a weak reference, so dropping the last
        // handle lets everything unwind.
        spawn_watch_loop(Arc::downgrade(&inner), fs_rx, command_rx);
        Ok(Self { inner })
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.inner.dir
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<Spell> {
        self.read_map().get(name).cloned()
    }

    /// Read-only snapshot of the current map.
    #[must_use]
    pub fn snapshot(&self) -> HashMap<String, Spell> {
        self.read_map().clone()
    }

    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.read_map().keys().cloned().collect();
        names.sort();
        names
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.read_map().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.read_map().is_empty()
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SpellEvent> {
        self.inner.event_tx.subscribe()
    }

    /// Force a re-scan outside the debounce window.
    pub async fn rescan(&self) -> Result<()> {
        self.inner
            .command_tx
            .send(WatcherCommand::Rescan)
            .await
            .map_err(|e| SpellError::Watcher(format!("failed to send rescan: {e}")))
    }

    fn read_map(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Spell>> {
        self.inner.spells.read().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for SpellDiscovery {
    fn drop(&mut self) {
        if Arc::strong_count(&self.inner) == 1 {
            let _ = self.inner.command_tx.try_send(WatcherCommand::Shutdown);
        }
    }
}

fn spawn_watch_loop(
    inner: std::sync::Weak<DiscoveryInner>,
    mut fs_rx: mpsc::Receiver<notify::Result<Event>>,
    mut command_rx: mpsc::Receiver<WatcherCommand>,
) {
    tokio::spawn(async move {
        let mut deadline: Option<Instant> = None;
        loop {
            tokio::select! {
                event = fs_rx.recv() => match event {
                    Some(Ok(evt)) => {
                        let Some(inner) = inner.upgrade() else { break };
                        if is_spell_event(&inner.dir, &evt) {
                            deadline = Some(Instant::now() + DISCOVERY_DEBOUNCE);
                        }
                    }
                    Some(Err(err)) => log::warn!("spell watcher error: {err}"),
                    None => break,
                },
                cmd = command_rx.recv() => match cmd {
                    Some(WatcherCommand::Rescan) => deadline = Some(Instant::now()),
                    Some(WatcherCommand::Shutdown) | None => break,
                },
                () = async {
                    if let Some(at) = deadline {
                        sleep_until(at).await;
                    }
                }, if deadline.is_some() => {
                    deadline = None;
                    let Some(inner) = inner.upgrade() else { break };
                    rescan_and_publish(&inner);
                }
            }
        }
    });
}

fn is_spell_event(dir: &Path, event: &Event) -> bool {
    if event.paths.is_empty() {
        return true;
    }
    event.paths.iter().any(|path| {
        path.parent() == Some(dir)
            && path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.ends_with(SPELL_FILE_SUFFIX))
    })
}

fn rescan_and_publish(inner: &DiscoveryInner) {
    let fresh = scan_spell_dir(&inner.dir);

    let mut events = Vec::new();
    {
        let mut current = inner.spells.write().unwrap_or_else(|e| e.into_inner());
        for (name, spell) in &fresh {
            match current.get(name) {
                None => events.push(SpellEvent::Added(name.clone())),
                Some(old) if old != spell => events.push(SpellEvent::Modified(name.clone())),
                Some(_) => {}
            }
        }
        for name in current.keys() {
            if !fresh.contains_key(name) {
                events.push(SpellEvent::Removed(name.clone()));
            }
        }
        *current = fresh;
    }

    for event in events {
        log::debug!("spell change: {event:?}");
        let _ = inner.event_tx.send(event);
    }
}

/// Parse every `*.spell.yaml` in `dir`. Parse failures are reported and
/// skipped; duplicate names resolve to the newest file by mtime.
fn scan_spell_dir(dir: &Path) -> HashMap<String, Spell> {
    let mut found: HashMap<String, (Spell, SystemTime)> = HashMap::new();

    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) => {
            log::warn!("cannot read spell dir {}: {err}", dir.display());
            return HashMap::new();
        }
    };

    for entry in entries.flatten() {
        let path = entry.path();
        let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if !file_name.ends_with(SPELL_FILE_SUFFIX) {
            continue;
        }

        let text = match std::fs::read_to_string(&path) {
            Ok(text) => text,
            Err(err) => {
                log::warn!("cannot read {}: {err}", path.display());
                continue;
            }
        };
        let spell = match Spell::parse(&text) {
            Ok(spell) => spell,
            Err(err) => {
                log::warn!("ignoring {}: {err}", path.display());
                continue;
            }
        };
        let modified = entry
            .metadata()
            .and_then(|m| m.modified())
            .unwrap_or(SystemTime::UNIX_EPOCH);

        match found.get(&spell.name) {
            Some((_, existing_mtime)) if *existing_mtime >= modified => {
                log::warn!(
                    "duplicate spell '{}' in {}; keeping the newer file",
                    spell.name,
                    file_name
                );
            }
            Some(_) => {
                log::warn!(
                    "duplicate spell '{}'; {} is newer and wins",
                    spell.name,
                    file_name
                );
                found.insert(spell.name.clone(), (spell, modified));
            }
            None => {
                found.insert(spell.name.clone(), (spell, modified));
            }
        }
    }

    found
        .into_iter()
        .map(|(name, (spell, _))| (name, spell))
        .collect()
}
