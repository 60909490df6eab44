// Walks a pharmacy-style tree (`DD.MM.YY/<n>-HH-MM-SS/<id>/`) end to end:
// enumeration, name decoding and content fetching over one session.

use chrono::{NaiveDate, NaiveTime};
use drev_adapters::{
    derive_key, grammar_for, AudioLocator, ContentFetcher, ContentLayout, FileMatch, GrammarKind,
    RemoteTreeWalker,
};
use drev_storage::{MemoryRemote, RemoteConnector};

const ROOT: &str = "/Developers/results-fitofarm";

fn seeded() -> MemoryRemote {
    let remote = MemoryRemote::new();
    let first = format!("{ROOT}/14.01.25/3-09-15-00/a81f");
    remote.add_file(&format!("{first}/a81f.txt"), "Hello, how can I help?");
    remote.add_file(
        &format!("{first}/a81f.json"),
        r#"{"metrics": {"politeness": 0.9, "friendliness": 0.8, "summary": "price check"}}"#,
    );
    remote.add_file(&format!("{first}/a81f.mp3"), vec![0u8; 4]);

    let second = format!("{ROOT}/14.01.25/3-11-00-30/b200");
    remote.add_file(&format!("{second}/b200.txt"), "Goodbye");
    remote.add_file(&format!("{second}/b200.json"), "not json");

    remote.add_file(&format!("{ROOT}/notes/1-00-00-00/c300/c300.txt"), "x");
    remote
}

fn layout() -> ContentLayout {
    ContentLayout {
        transcript: FileMatch::Extension("txt".into()),
        metrics: FileMatch::Extension("json".into()),
        audio: AudioLocator::InFolder {
            extensions: vec!["mp3".into(), "wav".into()],
        },
    }
}

#[tokio::test]
async fn pharmacy_tree_decodes_and_fetches() {
    let remote = seeded();
    let mut session = remote.connect().await.unwrap();
    let grammar = grammar_for(GrammarKind::DottedDate);
    let fetcher = ContentFetcher::new(layout());
    let mut walker = RemoteTreeWalker::new(ROOT, grammar.group_depth());

    let mut candidates = Vec::new();
    while let Some(candidate) = walker.next(session.as_mut()).await.unwrap() {
        candidates.push(candidate);
    }
    let mut leaves = candidates.iter().map(|c| c.leaf.as_str()).collect::<Vec<_>>();
    leaves.sort();
    assert_eq!(leaves, vec!["a81f", "b200", "c300"]);

    let first = candidates.iter().find(|c| c.leaf == "a81f").unwrap();
    assert_eq!(derive_key(grammar.default_key_strategy(), first), "a81f");
    let decoded = grammar.decode(first).unwrap();
    assert_eq!(decoded.date, NaiveDate::from_ymd_opt(2025, 1, 14).unwrap());
    assert_eq!(decoded.time, NaiveTime::from_hms_opt(9, 15, 0).unwrap());
    assert_eq!(decoded.channel.as_deref(), Some("3"));

    let content = fetcher.fetch(session.as_mut(), first).await.unwrap();
    assert_eq!(content.transcript_text(), "Hello, how can I help?");
    assert_eq!(content.metrics_or_default().politeness, 0.9);
    assert_eq!(content.summary(), "price check");
    assert_eq!(
        content.audio_reference.as_deref(),
        Some("/Developers/results-fitofarm/14.01.25/3-09-15-00/a81f/a81f.mp3")
    );

    let second = candidates.iter().find(|c| c.leaf == "b200").unwrap();
    let content = fetcher.fetch(session.as_mut(), second).await.unwrap();
    assert!(content.metrics.is_malformed());
    assert_eq!(content.audio_reference, None);

    // a non-date top-level folder is enumerated but never decodes
    let stray = candidates.iter().find(|c| c.leaf == "c300").unwrap();
    assert!(grammar.decode(stray).is_err());

    session.close().await;
}
