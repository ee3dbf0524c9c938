//! End-to-end chain scenarios: the full Policy → Scrub → Approval →
//! ToolAnalytics → Logging composition against a real SQLite store.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use mcptap_core::Direction;
use mcptap_core::approval::ApprovalManager;
use mcptap_core::bus::EventBus;
use mcptap_core::intercept::{
    ApprovalInterceptor, InterceptError, InterceptedMessage, Interceptor, InterceptorChain,
    LoggingInterceptor, META_SCRUB_COUNT, META_TOOLS_PRUNED, PolicyInterceptor, PruneConfig,
    ScrubInterceptor, ToolAnalyticsInterceptor,
};
use mcptap_core::jsonrpc::{self, MessageKind};
use mcptap_core::policy::{self, Engine};
use mcptap_core::store::{LogEntry, MessageStore, QueryFilter, Session, SqliteStore, StoreConfig};

const POLICY_YAML: &str = r#"
version: "1"
rules:
  - name: block-shell
    action: deny
    methods: ["tools/call"]
    tools: ["execute_command"]
  - name: review-deletes
    action: require_approval
    methods: ["tools/call"]
    tools: ["delete_file"]
"#;

struct Fixture {
    _dir: tempfile::TempDir,
    store: Arc<SqliteStore>,
    manager: ApprovalManager,
    chain: InterceptorChain,
    cancel: CancellationToken,
}

fn fixture(approval_timeout: Duration, scrub: bool, prune: PruneConfig) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let store =
        Arc::new(SqliteStore::open(dir.path().join("tap.db"), StoreConfig::default()).unwrap());
    let bus = EventBus::new(16);
    let manager = ApprovalManager::new(approval_timeout);

    let cfg = policy::loader::from_str(POLICY_YAML).unwrap();
    let chain = InterceptorChain::new(vec![
        Arc::new(PolicyInterceptor::new(Engine::new(cfg.rules))),
        Arc::new(ScrubInterceptor::new(scrub, &[])),
        Arc::new(ApprovalInterceptor::new(manager.clone())),
        Arc::new(ToolAnalyticsInterceptor::new(
            store.clone() as Arc<dyn MessageStore>,
            prune,
        )),
        Arc::new(LoggingInterceptor::new(
            store.clone() as Arc<dyn MessageStore>,
            bus,
        )),
    ]);

    Fixture {
        _dir: dir,
        store,
        manager,
        chain,
        cancel: CancellationToken::new(),
    }
}

fn msg(direction: Direction, raw: &str) -> InterceptedMessage {
    InterceptedMessage::new("s1".to_string(), direction, raw.as_bytes().to_vec())
}

#[tokio::test]
async fn deny_by_tool_name() {
    let f = fixture(Duration::from_secs(60), false, PruneConfig::default());

    let raw = r#"{"jsonrpc":"2.0","id":9,"method":"tools/call","params":{"name":"execute_command"}}"#;
    let mut m = msg(Direction::HostToServer, raw);
    let err = f.chain.process(&f.cancel, &mut m).await.unwrap_err();

    assert!(matches!(err, InterceptError::PolicyDenied { .. }));
    let response = jsonrpc::error_response(m.parsed.id.as_deref(), -32600, &err.to_string());
    assert_eq!(
        String::from_utf8(response).unwrap(),
        r#"{"jsonrpc":"2.0","id":9,"error":{"code":-32600,"message":"blocked by policy rule \"block-shell\""}}"#
    );
}

#[tokio::test]
async fn approval_approved_forwards_original_bytes() {
    let f = fixture(Duration::from_secs(60), false, PruneConfig::default());

    let raw = r#"{"jsonrpc":"2.0","id":2,"method":"tools/call","params":{"name":"delete_file"}}"#;
    let mut m = msg(Direction::HostToServer, raw);

    let resolver = {
        let manager = f.manager.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            assert_eq!(manager.pending_count(), 1);
            manager.resolve("apr-1", true).unwrap();
        })
    };

    let out = f.chain.process(&f.cancel, &mut m).await.unwrap().unwrap();
    assert_eq!(out, raw.as_bytes());
    resolver.await.unwrap();
    assert_eq!(f.manager.pending_count(), 0);
}

#[tokio::test]
async fn approval_timeout_blocks() {
    let f = fixture(Duration::from_millis(50), false, PruneConfig::default());

    let raw = r#"{"jsonrpc":"2.0","id":2,"method":"tools/call","params":{"name":"delete_file"}}"#;
    let mut m = msg(Direction::HostToServer, raw);

    let err = f.chain.process(&f.cancel, &mut m).await.unwrap_err();
    assert!(err.to_string().contains("timed out"), "{err}");

    let response = jsonrpc::error_response(m.parsed.id.as_deref(), -32600, &err.to_string());
    let parsed: serde_json::Value = serde_json::from_slice(&response).unwrap();
    assert_eq!(parsed["id"], 2);
    assert!(
        parsed["error"]["message"].as_str().unwrap().contains("timed out")
    );
}

#[tokio::test]
async fn redaction_rewrites_server_to_host() {
    let f = fixture(Duration::from_secs(60), true, PruneConfig::default());

    let raw =
        r#"{"jsonrpc":"2.0","id":6,"result":{"content":"Your key is sk-abcdefghij1234567890abcd"}}"#;
    let mut m = msg(Direction::ServerToHost, raw);
    let out = f.chain.process(&f.cancel, &mut m).await.unwrap().unwrap();

    let parsed: serde_json::Value = serde_json::from_slice(&out).unwrap();
    assert_eq!(parsed["result"]["content"], "Your key is [REDACTED:api_key]");
    assert!(m.meta_u64(META_SCRUB_COUNT).unwrap() >= 1);

    // The persisted payload is the redacted one.
    f.store.close();
    let entries = f.store.query(&QueryFilter::default()).unwrap();
    assert_eq!(entries.len(), 1);
    assert!(entries[0].payload.contains("[REDACTED:api_key]"));
    assert_eq!(entries[0].scrub_count, m.meta_u64(META_SCRUB_COUNT).unwrap() as i64);
    assert_eq!(entries[0].size_bytes, entries[0].payload.len() as i64);
}

#[tokio::test]
async fn redaction_preserves_keys() {
    let f = fixture(Duration::from_secs(60), true, PruneConfig::default());

    let mut m = msg(Direction::ServerToHost, r#"{"email":"test@example.com"}"#);
    let out = f.chain.process(&f.cancel, &mut m).await.unwrap().unwrap();
    let text = String::from_utf8(out).unwrap();
    assert!(text.contains("\"email\""));
    assert!(!text.contains("test@example.com"));
}

#[tokio::test]
async fn host_to_server_bytes_identical_with_scrubber_active() {
    let f = fixture(Duration::from_secs(60), true, PruneConfig::default());

    let raw = r#"{"jsonrpc":"2.0","id":4,"method":"tools/call","params":{"name":"read_file","arguments":{"note":"sk-abcdefghij1234567890abcd"}}}"#;
    let mut m = msg(Direction::HostToServer, raw);
    let out = f.chain.process(&f.cancel, &mut m).await.unwrap().unwrap();
    assert_eq!(out, raw.as_bytes());
}

#[tokio::test]
async fn tool_pruning_with_always_keep() {
    let prune = PruneConfig {
        unused_sessions: 3,
        keep_top_k: 0,
        always_keep: vec!["delete_file".to_string()],
    };
    let f = fixture(Duration::from_secs(60), false, prune);

    // Historical usage: read_file called 5 times.
    f.store
        .create_session(&Session {
            id: "s1".to_string(),
            started_at: chrono::Utc::now(),
            ended_at: None,
            command: "srv".to_string(),
            args: Vec::new(),
        })
        .unwrap();
    for _ in 0..5 {
        f.store.log_message(LogEntry {
            id: 0,
            timestamp: chrono::Utc::now(),
            session_id: "s1".to_string(),
            direction: Direction::HostToServer,
            kind: MessageKind::Request,
            method: "tools/call".to_string(),
            msg_id: "1".to_string(),
            payload: "{}".to_string(),
            size_bytes: 2,
            blocked: false,
            audit: false,
            scrub_count: 0,
            matched_rules: Vec::new(),
            tool_name: "read_file".to_string(),
            policy_action: String::new(),
        });
    }
    f.store.close(); // flush usage data; reads keep working

    // Request forwarded unchanged.
    let req_raw = r#"{"jsonrpc":"2.0","id":1,"method":"tools/list"}"#;
    let mut req = msg(Direction::HostToServer, req_raw);
    let out = f.chain.process(&f.cancel, &mut req).await.unwrap().unwrap();
    assert_eq!(out, req_raw.as_bytes());

    // Response rewritten with the pruned tool set.
    let resp_raw = r#"{"jsonrpc":"2.0","id":1,"result":{"tools":[{"name":"read_file"},{"name":"write_file"},{"name":"delete_file"}]}}"#;
    let mut resp = msg(Direction::ServerToHost, resp_raw);
    let out = f.chain.process(&f.cancel, &mut resp).await.unwrap().unwrap();

    let parsed: serde_json::Value = serde_json::from_slice(&out).unwrap();
    assert_eq!(parsed["id"], 1);
    let names: Vec<&str> = parsed["result"]["tools"]
        .as_array()
        .unwrap()
        .iter()
        .map(|t| t["name"].as_str().unwrap())
        .collect();
    assert!(names.contains(&"read_file"));
    assert!(names.contains(&"delete_file"));
    assert!(!names.contains(&"write_file"));
    assert_eq!(resp.meta_u64(META_TOOLS_PRUNED), Some(1));
}

#[tokio::test]
async fn audit_flag_reaches_the_store() {
    const AUDIT_POLICY: &str = r#"
rules:
  - name: watch-writes
    action: audit
    methods: ["tools/call"]
    tools: ["write_file"]
"#;
    let dir = tempfile::tempdir().unwrap();
    let store =
        Arc::new(SqliteStore::open(dir.path().join("tap.db"), StoreConfig::default()).unwrap());
    let cfg = policy::loader::from_str(AUDIT_POLICY).unwrap();
    let chain = InterceptorChain::new(vec![
        Arc::new(PolicyInterceptor::new(Engine::new(cfg.rules))),
        Arc::new(LoggingInterceptor::new(
            store.clone() as Arc<dyn MessageStore>,
            EventBus::new(16),
        )),
    ]);
    let cancel = CancellationToken::new();

    let raw = r#"{"jsonrpc":"2.0","id":5,"method":"tools/call","params":{"name":"write_file"}}"#;
    let mut m = msg(Direction::HostToServer, raw);
    chain.process(&cancel, &mut m).await.unwrap();

    store.close();
    let entries = store.query(&QueryFilter::default()).unwrap();
    assert_eq!(entries.len(), 1);
    assert!(entries[0].audit);
    assert_eq!(entries[0].policy_action, "audit");
    assert_eq!(entries[0].matched_rules, vec!["watch-writes"]);
    assert_eq!(entries[0].tool_name, "write_file");
}
