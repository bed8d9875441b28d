use grimoire_spellbook::{SpellDiscovery, SpellEvent};
use std::path::Path;
use std::time::Duration;
use tokio::sync::broadcast::Receiver;

fn spell_doc(name: &str, description: &str) -> String {
    format!(
        "name: {name}\nversion: \"1.0.0\"\ndescription: {description}\nkeywords: [alpha, beta, gamma]\nserver:\n  transport: stdio\n  command: \"true\"\n"
    )
}

fn write_spell(dir: &Path, file: &str, doc: &str) {
    std::fs::write(dir.join(file), doc).expect("write spell file");
}

async fn wait_for(rx: &mut Receiver<SpellEvent>, want: &SpellEvent) {
    let deadline = Duration::from_secs(5);
    loop {
        match tokio::time::timeout(deadline, rx.recv()).await {
            Ok(Ok(event)) if &event == want => return,
            Ok(Ok(_)) => {}
            Ok(Err(err)) => panic!("event channel closed: {err}"),
            Err(_) => panic!("timed out waiting for {want:?}"),
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn watcher_emits_added_modified_removed() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let discovery = SpellDiscovery::start(tmp.path().to_path_buf()).expect("start discovery");
    let mut events = discovery.subscribe();

    write_spell(tmp.path(), "notes.spell.yaml", &spell_doc("notes", "take notes"));
    wait_for(&mut events, &SpellEvent::Added("notes".to_string())).await;
    assert_eq!(
        discovery.get("notes").expect("spell present").description,
        "take notes"
    );

    write_spell(
        tmp.path(),
        "notes.spell.yaml",
        &spell_doc("notes", "take better notes"),
    );
    wait_for(&mut events, &SpellEvent::Modified("notes".to_string())).await;
    assert_eq!(
        discovery.get("notes").expect("spell present").description,
        "take better notes"
    );

    std::fs::remove_file(tmp.path().join("notes.spell.yaml")).expect("remove spell");
    wait_for(&mut events, &SpellEvent::Removed("notes".to_string())).await;
    assert!(discovery.get("notes").is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn initial_scan_populates_before_watching() {
    let tmp = tempfile::tempdir().expect("tempdir");
    write_spell(tmp.path(), "a.spell.yaml", &spell_doc("a", "first"));
    write_spell(tmp.path(), "b.spell.yaml", &spell_doc("b", "second"));

    let discovery = SpellDiscovery::start(tmp.path().to_path_buf()).expect("start discovery");
    assert_eq!(discovery.names(), vec!["a".to_string(), "b".to_string()]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn broken_file_is_ignored_until_it_parses() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let discovery = SpellDiscovery::start(tmp.path().to_path_buf()).expect("start discovery");
    let mut events = discovery.subscribe();

    write_spell(tmp.path(), "wip.spell.yaml", "name: [broken");
    // Give the debounce a chance to run; the broken file must not surface.
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert!(discovery.is_empty());

    write_spell(tmp.path(), "wip.spell.yaml", &spell_doc("wip", "now valid"));
    wait_for(&mut events, &SpellEvent::Added("wip".to_string())).await;
    assert!(discovery.get("wip").is_some());
}
