//! End-to-end runner scenarios over a native mock protocol plugin

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};

use questplugin::{
    EmitEvent, PluginContext, PluginError, PluginRegistry, ProtocolPlugin, ProtocolRequest, ProtocolResponse,
};
use questrun::events::types::RunEvent;
use questrun::runner::{Runner, RunnerConfig};
use questrun::{Collection, FilterSpec, TestStatus};

/// What the mock saw for one executed request
#[derive(Debug, Clone)]
struct CallRecord {
    name: String,
    url: String,
    cookie_header: Option<String>,
}

/// Per-request behavior overrides, keyed by request name
#[derive(Debug, Clone, Default)]
struct Behavior {
    status: Option<u16>,
    set_cookies: Vec<String>,
    emit_events: Vec<(String, Value)>,
    delay_ms: u64,
    fail: bool,
}

/// A protocol plugin that records calls and plays back behaviors
struct MockProtocol {
    calls: Arc<Mutex<Vec<CallRecord>>>,
    behaviors: HashMap<String, Behavior>,
}

impl MockProtocol {
    fn new(behaviors: HashMap<String, Behavior>) -> (Arc<Self>, Arc<Mutex<Vec<CallRecord>>>) {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let plugin = Arc::new(Self {
            calls: Arc::clone(&calls),
            behaviors,
        });
        (plugin, calls)
    }
}

#[async_trait]
impl ProtocolPlugin for MockProtocol {
    fn name(&self) -> &str {
        "mock"
    }

    fn protocols(&self) -> Vec<String> {
        vec!["mock".to_string()]
    }

    async fn execute(
        &self,
        request: ProtocolRequest,
        _context: PluginContext,
        _options: Value,
        emit: EmitEvent,
    ) -> Result<ProtocolResponse, PluginError> {
        let behavior = self.behaviors.get(&request.name).cloned().unwrap_or_default();
        self.calls.lock().unwrap().push(CallRecord {
            name: request.name.clone(),
            url: request.data.get("url").and_then(Value::as_str).unwrap_or("").to_string(),
            cookie_header: request.cookie_header.clone(),
        });

        if behavior.delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(behavior.delay_ms)).await;
        }
        for (event, data) in &behavior.emit_events {
            emit(event.clone(), data.clone()).await;
        }
        if behavior.fail {
            return Err(PluginError::Execution {
                name: "mock".to_string(),
                reason: "connection refused".to_string(),
            });
        }

        let mut headers = std::collections::BTreeMap::new();
        if !behavior.set_cookies.is_empty() {
            headers.insert(
                "Set-Cookie".to_string(),
                questplugin::contract::HeaderValue::Multi(behavior.set_cookies.clone()),
            );
        }
        Ok(ProtocolResponse {
            status: behavior.status.unwrap_or(200),
            status_text: "OK".to_string(),
            body: json!({ "echo": request.data.get("url").cloned().unwrap_or(Value::Null) }),
            headers,
            duration_ms: 1,
            error: None,
        })
    }
}

fn runner_with_mock(behaviors: HashMap<String, Behavior>, config: RunnerConfig) -> (Runner, Arc<Mutex<Vec<CallRecord>>>) {
    let registry = Arc::new(PluginRegistry::new());
    let (plugin, calls) = MockProtocol::new(behaviors);
    registry.register_protocol(plugin);
    (Runner::with_registry(config, registry), calls)
}

/// Drain every event emitted so far into a vector
fn drain(rx: &mut tokio::sync::broadcast::Receiver<RunEvent>) -> Vec<RunEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

fn position(events: &[RunEvent], event_type: &str, path_contains: &str) -> Option<usize> {
    events
        .iter()
        .position(|e| e.event_type() == event_type && e.envelope().path.contains(path_contains))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn simple_sequential_run() {
    let collection = Collection::parse(
        r#"{
            "info": { "id": "c", "name": "Seq", "version": "1", "protocol": "mock" },
            "items": [
                { "type": "request", "id": "a", "name": "A", "data": { "url": "mock://a" },
                  "postScript": "quest.test('a ok', function() quest.expect(quest.response.status).to_equal(200) end)" },
                { "type": "request", "id": "b", "name": "B", "data": { "url": "mock://b" },
                  "postScript": "quest.test('b ok', function() quest.expect(quest.response.status).to_equal(200) end)" }
            ]
        }"#,
    )
    .unwrap();

    let (runner, calls) = runner_with_mock(HashMap::new(), RunnerConfig::default());
    let mut rx = runner.bus().subscribe();
    let result = runner.run(collection).await.unwrap();

    assert!(result.passed(), "run failed: {result:?}");
    assert_eq!(result.summary.total_requests, 2);
    assert_eq!(result.summary.total_tests, 2);
    assert_eq!(result.summary.passed_tests, 2);
    assert_eq!(result.expected_tests, 2);

    // Strict per-request causality: A's whole bracket before B's
    let events = drain(&mut rx);
    let a_before = position(&events, "beforeItem", "/A").unwrap();
    let a_request = position(&events, "beforeRequest", "/A").unwrap();
    let a_after = position(&events, "afterItem", "/A").unwrap();
    let b_before = position(&events, "beforeItem", "/B").unwrap();
    assert!(a_before < a_request && a_request < a_after && a_after < b_before);

    let order: Vec<String> = calls.lock().unwrap().iter().map(|c| c.name.clone()).collect();
    assert_eq!(order, vec!["A", "B"]);

    // Run bracket around everything
    assert_eq!(events.first().map(|e| e.event_type()), Some("beforeRun"));
    assert_eq!(events.last().map(|e| e.event_type()), Some("afterRun"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn parallel_respects_depends_on() {
    let collection = Collection::parse(
        r#"{
            "info": { "id": "c", "name": "Par", "version": "1", "protocol": "mock" },
            "options": { "execution": { "allowParallel": true, "maxConcurrency": 4 } },
            "items": [
                { "type": "request", "id": "a", "name": "A", "data": { "url": "mock://a" } },
                { "type": "request", "id": "b", "name": "B", "data": { "url": "mock://b" } },
                { "type": "request", "id": "cc", "name": "C", "data": { "url": "mock://c" } },
                { "type": "request", "id": "d", "name": "D", "dependsOn": ["a", "cc"], "data": { "url": "mock://d" } }
            ]
        }"#,
    )
    .unwrap();

    let mut behaviors = HashMap::new();
    behaviors.insert("A".to_string(), Behavior { delay_ms: 30, ..Default::default() });
    behaviors.insert("C".to_string(), Behavior { delay_ms: 15, ..Default::default() });

    let (runner, _calls) = runner_with_mock(behaviors, RunnerConfig::default());
    let mut rx = runner.bus().subscribe();
    let result = runner.run(collection).await.unwrap();
    assert_eq!(result.summary.total_requests, 4);
    assert!(!result.aborted);

    let events = drain(&mut rx);
    let d_before = position(&events, "beforeItem", "/D").unwrap();
    let a_after = position(&events, "afterItem", "/A").unwrap();
    let c_after = position(&events, "afterItem", "/C").unwrap();
    assert!(d_before > a_after, "D started before its dependency A finished");
    assert!(d_before > c_after, "D started before its dependency C finished");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn folder_condition_false_skips_subtree() {
    let collection = Collection::parse(
        r#"{
            "info": { "id": "c", "name": "Cond", "version": "1", "protocol": "mock" },
            "items": [
                {
                    "type": "folder", "id": "f", "name": "F",
                    "condition": "false",
                    "preScript": "error('folder pre must never run')",
                    "items": [
                        { "type": "request", "id": "r1", "name": "R1", "data": { "url": "mock://1" } },
                        { "type": "request", "id": "r2", "name": "R2", "data": { "url": "mock://2" } }
                    ]
                },
                { "type": "request", "id": "r3", "name": "R3", "data": { "url": "mock://3" } }
            ]
        }"#,
    )
    .unwrap();

    let (runner, calls) = runner_with_mock(HashMap::new(), RunnerConfig::default());
    let mut rx = runner.bus().subscribe();
    let result = runner.run(collection).await.unwrap();

    // The skipped requests appear exactly once each, tagged
    assert_eq!(result.summary.total_requests, 3);
    let skipped: Vec<_> = result
        .results
        .iter()
        .filter(|r| r.script_error.as_deref() == Some("Skipped by condition"))
        .collect();
    assert_eq!(skipped.len(), 2);
    assert!(skipped.iter().all(|r| r.tests.is_empty()));

    // Only R3 actually executed
    let executed: Vec<String> = calls.lock().unwrap().iter().map(|c| c.name.clone()).collect();
    assert_eq!(executed, vec!["R3"]);

    let events = drain(&mut rx);
    assert!(position(&events, "beforeRequest", "/F/").is_none());
    // Enter was skipped, so no folder bracket is emitted at all
    assert!(position(&events, "beforeFolder", "/F").is_none());
    assert!(position(&events, "afterFolder", "/F").is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn bail_stops_after_first_failed_test() {
    let collection = Collection::parse(
        r#"{
            "info": { "id": "c", "name": "Bail", "version": "1", "protocol": "mock" },
            "options": { "execution": { "bail": true } },
            "items": [
                { "type": "request", "id": "a", "name": "A", "data": { "url": "mock://a" },
                  "postScript": "quest.test('a', function() end)" },
                { "type": "request", "id": "b", "name": "B", "data": { "url": "mock://b" },
                  "postScript": "quest.test('b', function() quest.expect(quest.response.status).to_equal(500) end)" },
                { "type": "request", "id": "cc", "name": "C", "data": { "url": "mock://c" },
                  "postScript": "quest.test('c', function() end)" }
            ]
        }"#,
    )
    .unwrap();

    let (runner, calls) = runner_with_mock(HashMap::new(), RunnerConfig::default());
    let result = runner.run(collection).await.unwrap();

    assert!(result.aborted);
    assert_eq!(result.summary.failed_tests, 1);
    assert!(result.summary.total_tests >= 2);

    // The third request never performed I/O; it surfaces as a bail skip
    let executed: Vec<String> = calls.lock().unwrap().iter().map(|c| c.name.clone()).collect();
    assert_eq!(executed, vec!["A", "B"]);
    let c_result = result.results.iter().find(|r| r.name == "C").unwrap();
    assert_eq!(c_result.script_error.as_deref(), Some("Skipped by bail"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn non_persistent_jar_clears_between_requests() {
    let collection = Collection::parse(
        r#"{
            "info": { "id": "c", "name": "Jar", "version": "1", "protocol": "mock" },
            "items": [
                { "type": "request", "id": "a", "name": "SetCookie", "data": { "url": "http://api.test/login" } },
                { "type": "request", "id": "b", "name": "UseCookie", "data": { "url": "http://api.test/me" } }
            ]
        }"#,
    )
    .unwrap();

    let mut behaviors = HashMap::new();
    behaviors.insert(
        "SetCookie".to_string(),
        Behavior {
            set_cookies: vec!["session=s1; Path=/".to_string()],
            ..Default::default()
        },
    );

    // persist=false (default): the second request sees no cookie
    let (runner, calls) = runner_with_mock(behaviors.clone(), RunnerConfig::default());
    runner.run(collection.clone()).await.unwrap();
    {
        let calls = calls.lock().unwrap();
        assert_eq!(calls[1].name, "UseCookie");
        assert_eq!(calls[1].cookie_header, None);
    }

    // persist=true: the cookie carries over
    let config = RunnerConfig {
        options: json!({ "jar": { "persist": true } }),
        ..Default::default()
    };
    let (runner, calls) = runner_with_mock(behaviors, config);
    runner.run(collection).await.unwrap();
    {
        let calls = calls.lock().unwrap();
        assert_eq!(calls[1].cookie_header.as_deref(), Some("session=s1"));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn persistent_jar_with_parallel_is_rejected() {
    let collection = Collection::parse(
        r#"{
            "info": { "id": "c", "name": "Bad", "version": "1", "protocol": "mock" },
            "options": { "jar": { "persist": true }, "execution": { "allowParallel": true } },
            "items": [
                { "type": "request", "id": "a", "name": "A", "data": { "url": "mock://a" } }
            ]
        }"#,
    )
    .unwrap();

    let (runner, calls) = runner_with_mock(HashMap::new(), RunnerConfig::default());
    let result = runner.run(collection).await.unwrap();

    assert!(!result.validation_errors.is_empty());
    assert_eq!(result.summary.total_requests, 0);
    assert!(calls.lock().unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn filter_honors_dependency_closure() {
    let source = r#"{
        "info": { "id": "c", "name": "Filter", "version": "1", "protocol": "mock" },
        "items": [
            { "type": "request", "id": "a", "name": "A", "data": { "url": "mock://a" } },
            { "type": "request", "id": "b", "name": "B", "dependsOn": ["a"], "data": { "url": "mock://b" } },
            { "type": "request", "id": "cc", "name": "C", "data": { "url": "mock://c" } }
        ]
    }"#;

    // Default: the dependency closure pulls A in
    let config = RunnerConfig {
        filter: Some(FilterSpec {
            pattern: Some("^request:/B$".to_string()),
            exclude_deps: false,
        }),
        ..Default::default()
    };
    let (runner, calls) = runner_with_mock(HashMap::new(), config);
    let result = runner.run(Collection::parse(source).unwrap()).await.unwrap();
    assert_eq!(result.summary.total_requests, 2);
    let executed: Vec<String> = calls.lock().unwrap().iter().map(|c| c.name.clone()).collect();
    assert_eq!(executed, vec!["A", "B"]);

    // excludeDeps: B runs alone
    let config = RunnerConfig {
        filter: Some(FilterSpec {
            pattern: Some("^request:/B$".to_string()),
            exclude_deps: true,
        }),
        ..Default::default()
    };
    let (runner, calls) = runner_with_mock(HashMap::new(), config);
    let result = runner.run(Collection::parse(source).unwrap()).await.unwrap();
    assert_eq!(result.summary.total_requests, 1);
    let executed: Vec<String> = calls.lock().unwrap().iter().map(|c| c.name.clone()).collect();
    assert_eq!(executed, vec!["B"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_data_drives_iterations() {
    let collection = Collection::parse(
        r#"{
            "info": { "id": "c", "name": "Data", "version": "1", "protocol": "mock" },
            "testData": [ { "user": "alice" }, { "user": "bob" } ],
            "items": [
                { "type": "request", "id": "r", "name": "Who", "data": { "url": "mock://{{user}}" },
                  "postScript": "quest.test('row seen', function() quest.expect(quest.iteration.data.user).to_contain(quest.iteration.data.user) end)" }
            ]
        }"#,
    )
    .unwrap();

    let (runner, calls) = runner_with_mock(HashMap::new(), RunnerConfig::default());
    let result = runner.run(collection).await.unwrap();

    assert_eq!(result.iterations, 2);
    assert_eq!(result.summary.total_requests, 2);
    assert!(result.passed());

    // The iteration row fed variable resolution
    let urls: Vec<String> = calls.lock().unwrap().iter().map(|c| c.url.clone()).collect();
    assert_eq!(urls, vec!["mock://alice", "mock://bob"]);

    // Results carry their iteration index
    assert_eq!(result.results[0].iteration, 0);
    assert_eq!(result.results[1].iteration, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn scopes_and_lifecycle_scripts_flow_into_requests() {
    let collection = Collection::parse(
        r#"{
            "info": { "id": "c", "name": "Scopes", "version": "1", "protocol": "mock" },
            "variables": { "base": "mock://root" },
            "collectionPreScript": "quest.collectionVariables.set('token', 'from-pre')",
            "items": [
                {
                    "type": "folder", "id": "f", "name": "Zone",
                    "preScript": "quest.variables.set('zone', 'inner')",
                    "items": [
                        { "type": "request", "id": "r", "name": "Get",
                          "data": { "url": "{{base}}/{{zone}}/{{token}}" } }
                    ]
                }
            ]
        }"#,
    )
    .unwrap();

    let (runner, calls) = runner_with_mock(HashMap::new(), RunnerConfig::default());
    let result = runner.run(collection).await.unwrap();
    assert!(result.passed(), "{result:?}");

    let urls: Vec<String> = calls.lock().unwrap().iter().map(|c| c.url.clone()).collect();
    assert_eq!(urls, vec!["mock://root/inner/from-pre"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn plugin_events_run_their_scripts() {
    let collection = Collection::parse(
        r#"{
            "info": { "id": "c", "name": "Events", "version": "1", "protocol": "mock" },
            "items": [
                { "type": "request", "id": "r", "name": "Stream", "data": { "url": "mock://stream" },
                  "events": [
                      { "event": "message",
                        "script": "quest.test('got message', function() quest.expect(quest.event.data.seq).to_be_above(0) end)" }
                  ] }
            ]
        }"#,
    )
    .unwrap();

    let mut behaviors = HashMap::new();
    behaviors.insert(
        "Stream".to_string(),
        Behavior {
            emit_events: vec![
                ("message".to_string(), json!({ "seq": 1 })),
                ("message".to_string(), json!({ "seq": 2 })),
                ("ignored".to_string(), json!({})),
            ],
            ..Default::default()
        },
    );

    let (runner, _calls) = runner_with_mock(behaviors, RunnerConfig::default());
    let mut rx = runner.bus().subscribe();
    let result = runner.run(collection).await.unwrap();
    assert!(result.passed(), "{result:?}");

    // Two event-script invocations, both recording a test tagged with
    // the event name
    let request = &result.results[0];
    assert_eq!(request.tests.len(), 2);
    assert!(request.tests.iter().all(|t| t.status == TestStatus::Passed));
    assert!(request.tests.iter().all(|t| t.event.as_deref() == Some("message")));

    let events = drain(&mut rx);
    let script_events: Vec<&RunEvent> = events.iter().filter(|e| e.event_type() == "beforeEventScript").collect();
    assert_eq!(script_events.len(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn protocol_failure_does_not_abort() {
    let collection = Collection::parse(
        r#"{
            "info": { "id": "c", "name": "Err", "version": "1", "protocol": "mock" },
            "items": [
                { "type": "request", "id": "a", "name": "Broken", "data": { "url": "mock://down" },
                  "postScript": "quest.test('expects failure', function() quest.expect(quest.response.error).to_contain('refused') end)" },
                { "type": "request", "id": "b", "name": "After", "data": { "url": "mock://up" } }
            ]
        }"#,
    )
    .unwrap();

    let mut behaviors = HashMap::new();
    behaviors.insert("Broken".to_string(), Behavior { fail: true, ..Default::default() });

    let (runner, calls) = runner_with_mock(behaviors, RunnerConfig::default());
    let result = runner.run(collection).await.unwrap();

    // The transport error was carried, asserted on, and the run went on
    assert!(!result.aborted);
    assert_eq!(result.summary.failed_tests, 0);
    let executed: Vec<String> = calls.lock().unwrap().iter().map(|c| c.name.clone()).collect();
    assert_eq!(executed, vec!["Broken", "After"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn failing_pre_script_fails_fast() {
    let collection = Collection::parse(
        r#"{
            "info": { "id": "c", "name": "FailFast", "version": "1", "protocol": "mock" },
            "items": [
                { "type": "request", "id": "a", "name": "Boom", "data": { "url": "mock://a" },
                  "preScript": "error('pre blew up')" },
                { "type": "request", "id": "b", "name": "Never", "data": { "url": "mock://b" } }
            ]
        }"#,
    )
    .unwrap();

    let (runner, calls) = runner_with_mock(HashMap::new(), RunnerConfig::default());
    let result = runner.run(collection).await.unwrap();

    assert!(result.aborted);
    let boom = result.results.iter().find(|r| r.name == "Boom").unwrap();
    assert!(!boom.success);
    assert!(boom.script_error.as_deref().unwrap().contains("pre blew up"));
    // No I/O happened at all
    assert!(calls.lock().unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn external_abort_marks_run_aborted() {
    let collection = Collection::parse(
        r#"{
            "info": { "id": "c", "name": "Abort", "version": "1", "protocol": "mock" },
            "items": [
                { "type": "request", "id": "a", "name": "Slow", "data": { "url": "mock://slow" } },
                { "type": "request", "id": "b", "name": "Next", "data": { "url": "mock://next" } }
            ]
        }"#,
    )
    .unwrap();

    let mut behaviors = HashMap::new();
    behaviors.insert("Slow".to_string(), Behavior { delay_ms: 200, ..Default::default() });

    let abort = tokio_util::sync::CancellationToken::new();
    let config = RunnerConfig {
        abort: Some(abort.clone()),
        ..Default::default()
    };
    let (runner, calls) = runner_with_mock(behaviors, config);

    let canceller = tokio::spawn({
        let abort = abort.clone();
        async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            abort.cancel();
        }
    });

    let result = runner.run(collection).await.unwrap();
    canceller.await.unwrap();

    assert!(result.aborted);
    assert_eq!(result.abort_reason.as_deref(), Some("aborted by caller"));
    // The in-flight request finished; the next one never dispatched
    let executed: Vec<String> = calls.lock().unwrap().iter().map(|c| c.name.clone()).collect();
    assert_eq!(executed, vec!["Slow"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn globals_persist_across_iterations() {
    let collection = Collection::parse(
        r#"{
            "info": { "id": "c", "name": "Carry", "version": "1", "protocol": "mock" },
            "testData": [ {}, {} ],
            "items": [
                { "type": "request", "id": "r", "name": "Count", "data": { "url": "mock://r" },
                  "postScript": "local n = tonumber(quest.global.variables.get('count') or '0') quest.global.variables.set('count', tostring(n + 1)) quest.test('counted', function() end)" }
            ]
        }"#,
    )
    .unwrap();

    let (runner, _calls) = runner_with_mock(HashMap::new(), RunnerConfig::default());
    let result = runner.run(collection).await.unwrap();
    assert!(result.passed(), "{result:?}");
    assert_eq!(result.summary.total_tests, 2);
}
