//! External tests for knowledge-base backends opened through configuration,
//! the cache in front of remote backends, and backend conversion.

use std::time::{Duration, Instant};

use build_failure_analyzer::config::{AnalyzerConfig, BackendKind, KnowledgeBaseConfig};
use build_failure_analyzer::kb::{self, KnowledgeBase, LocalFileKnowledgeBase};
use build_failure_analyzer::model::{BuildResult, FailureCause, Indication, Statistics, StatisticsFilter};

fn sqlite_config(dir: &tempfile::TempDir) -> KnowledgeBaseConfig {
    KnowledgeBaseConfig {
        backend: BackendKind::Sqlite,
        path: Some(dir.path().join("bfa.db")),
        enable_statistics: true,
        cache_refresh_secs: 3600,
        ..KnowledgeBaseConfig::default()
    }
}

fn cause(name: &str, category: &str) -> FailureCause {
    FailureCause::new(name, format!("{name} happened"))
        .with_category(category)
        .with_indication(Indication::single_line(format!(".*{name}.*")).unwrap())
}

fn eventually(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    false
}

fn stat(project: &str, number: u64, start: u64, result: BuildResult) -> Statistics {
    Statistics {
        project_name: project.into(),
        build_number: number,
        display_name: format!("#{number}"),
        start_time: start,
        duration: 10,
        trigger_causes: vec![],
        node_name: "agent-1".into(),
        master: "ci".into(),
        time_zone_offset: "+00:00".into(),
        result: result.to_string(),
        upstream_cause: None,
        failure_causes: vec![],
    }
}

// -- SQLite through the cache ----------------------------------------------

#[test]
fn test_sqlite_cold_cache_serves_full_list() {
    let dir = tempfile::tempdir().unwrap();
    {
        let kb = kb::open(&sqlite_config(&dir)).unwrap();
        kb.add_cause(cause("OutOfMemory", "jvm")).unwrap();
        kb.add_cause(cause("DiskFull", "infra")).unwrap();
    }
    let kb = kb::open(&sqlite_config(&dir)).unwrap();
    assert_eq!(kb.get_causes().unwrap().len(), 2);
    assert_eq!(kb.get_categories().unwrap(), vec!["infra".to_string(), "jvm".to_string()]);
}

#[test]
fn test_sqlite_writes_visible_after_refresh_and_after_stop() {
    let dir = tempfile::tempdir().unwrap();
    let kb = kb::open(&sqlite_config(&dir)).unwrap();
    kb.start().unwrap();
    let c = kb.add_cause(cause("Segfault", "native")).unwrap();
    assert!(eventually(|| kb.get_causes().unwrap().len() == 1));

    kb.remove_cause(&c.id, "ops").unwrap();
    assert!(eventually(|| kb.get_causes().unwrap().is_empty()));
    assert!(kb.get_cause(&c.id).unwrap().unwrap().is_removed());

    kb.stop();
    assert!(kb.get_causes().unwrap().is_empty());
}

#[test]
fn test_sqlite_shallow_causes_sorted_case_insensitive() {
    let dir = tempfile::tempdir().unwrap();
    let kb = kb::open(&sqlite_config(&dir)).unwrap();
    for name in ["beta", "Alpha", "gamma"] {
        kb.add_cause(cause(name, "x")).unwrap();
    }
    let names: Vec<String> = kb.get_shallow_causes().unwrap().into_iter().map(|c| c.name).collect();
    assert_eq!(names, vec!["Alpha", "beta", "gamma"]);
}

#[test]
fn test_sqlite_statistics_filter_and_limit() {
    let dir = tempfile::tempdir().unwrap();
    let kb = kb::open(&sqlite_config(&dir)).unwrap();
    kb.save_statistics(&stat("app", 1, 100, BuildResult::Failure)).unwrap();
    kb.save_statistics(&stat("app", 2, 200, BuildResult::Aborted)).unwrap();
    kb.save_statistics(&stat("lib", 1, 300, BuildResult::Failure)).unwrap();

    let app = kb
        .get_statistics(&StatisticsFilter::default().project("app"), None)
        .unwrap();
    assert_eq!(app.len(), 2);

    let failures = kb
        .get_statistics(&StatisticsFilter::default().result(BuildResult::Failure).since(150), None)
        .unwrap();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].project_name, "lib");

    assert_eq!(kb.get_statistics(&StatisticsFilter::default(), Some(2)).unwrap().len(), 2);
}

// -- Local file ----------------------------------------------------------------

#[test]
fn test_local_file_persists_across_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("causes.json");
    let id = {
        let kb = LocalFileKnowledgeBase::open(&path).unwrap();
        kb.add_cause(cause("Timeout", "net")).unwrap().id
    };
    let kb = LocalFileKnowledgeBase::open(&path).unwrap();
    assert_eq!(kb.get_cause(&id).unwrap().unwrap().name, "Timeout");
    assert!(!kb.is_statistics_enabled());
}

#[test]
fn test_convert_local_into_sqlite_keeps_ids() {
    let dir = tempfile::tempdir().unwrap();
    let local = LocalFileKnowledgeBase::in_memory();
    let a = local.add_cause(cause("A", "x")).unwrap();
    let b = local.add_cause(cause("B", "y")).unwrap();

    let sqlite = kb::open(&sqlite_config(&dir)).unwrap();
    assert_eq!(sqlite.convert_from(&local).unwrap(), 2);
    assert_eq!(sqlite.get_cause(&a.id).unwrap().unwrap().name, "A");
    assert_eq!(sqlite.get_cause(&b.id).unwrap().unwrap().name, "B");
}

// -- Configuration ---------------------------------------------------------------

#[test]
fn test_config_file_selects_backend() {
    let dir = tempfile::tempdir().unwrap();
    let cfg_path = dir.path().join("bfa.toml");
    let db = dir.path().join("kb.db");
    std::fs::write(
        &cfg_path,
        format!(
            "[knowledge_base]\nbackend = \"sqlite\"\npath = {:?}\nenable_statistics = true\n",
            db.display().to_string()
        ),
    )
    .unwrap();
    let cfg = AnalyzerConfig::load(&cfg_path).unwrap();
    let kb = kb::open(&cfg.knowledge_base).unwrap();
    assert_eq!(kb.backend_name(), "sqlite");
    assert!(kb.is_statistics_enabled());
}
