use std::{
    collections::{HashMap, HashSet},
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use kverify_fetcher::{FailureKind, FetchError, FetchFuture, Fetcher};
use kverify_resources::{ResourceKind, ResourceRef, Snapshot};
use serde_json::json;

use crate::*;

#[derive(Default)]
struct ScriptedFetcher {
    snapshots: HashMap<ResourceRef, Snapshot>,
    broken: HashSet<ResourceRef>,
    yields: HashMap<ResourceRef, usize>,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ScriptedFetcher {
    fn with(mut self, resource: &ResourceRef, value: serde_json::Value) -> Self {
        let snapshot = Snapshot::from_value(resource.kind(), value).expect("snapshot");
        self.snapshots.insert(resource.clone(), snapshot);
        self
    }

    fn broken(mut self, resource: &ResourceRef) -> Self {
        self.broken.insert(resource.clone());
        self
    }

    fn slow(mut self, resource: &ResourceRef, yields: usize) -> Self {
        self.yields.insert(resource.clone(), yields);
        self
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Fetcher for ScriptedFetcher {
    fn fetch<'a>(&'a self, resource: &'a ResourceRef) -> FetchFuture<'a> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            for _ in 0..self.yields.get(resource).copied().unwrap_or(1) {
                tokio::task::yield_now().await;
            }
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            if self.broken.contains(resource) {
                return Err(FetchError::transport(resource, "connection refused"));
            }
            self.snapshots
                .get(resource)
                .cloned()
                .ok_or_else(|| FetchError::NotFound(resource.clone()))
        })
    }
}

fn deployment_ref(name: &str, namespace: &str) -> ResourceRef {
    ResourceRef::new(ResourceKind::Deployment, name, namespace).unwrap()
}

fn key(name: &str) -> RegistryKey {
    RegistryKey::new(name).unwrap()
}

fn field(path: &str, expect: Expectation) -> Assertion {
    Assertion::field(path.parse().expect(path), expect)
}

fn web_deployment(available: i32) -> serde_json::Value {
    json!({
        "kind": "Deployment",
        "metadata": { "name": "videos-web", "namespace": "frontend" },
        "spec": {
            "selector": { "matchLabels": { "app": "videos-web" } },
            "template": {
                "metadata": { "labels": { "app": "videos-web" } },
                "spec": { "containers": [{
                    "name": "videos-web",
                    "image": "aimvector/videos-web:1.0.0",
                    "imagePullPolicy": "Always",
                    "ports": [{ "containerPort": 80 }]
                }] }
            }
        },
        "status": { "replicas": 1, "availableReplicas": available, "readyReplicas": 1 }
    })
}

fn web_checks() -> Vec<Assertion> {
    vec![
        field("status.availableReplicas", Expectation::Equals(1.into())),
        field("status.readyReplicas", Expectation::Equals(1.into())),
        field("containers[0].ports", Expectation::Equals(1.into())),
        field(
            "containers[0].imagePullPolicy",
            Expectation::Equals("Always".into()),
        ),
    ]
}

fn unit(name: &str, resource: ResourceRef, assertions: Vec<Assertion>) -> CheckUnit {
    CheckUnit::builder()
        .name(name)
        .resource(resource)
        .assertions(assertions)
        .build()
}

async fn run(fetcher: ScriptedFetcher, units: Vec<CheckUnit>) -> SessionReport {
    Session::new(Arc::new(fetcher), units, SessionOptions::default())
        .expect("valid session")
        .execute()
        .await
}

fn assertions_of(result: &CheckResult) -> &[AssertionOutcome] {
    match &result.outcome {
        CheckOutcome::Evaluated { assertions } => assertions.as_slice(),
        other => panic!("expected evaluated outcome, got {other:?}"),
    }
}

#[tokio::test]
async fn satisfied_deployment_passes_every_assertion() {
    let web = deployment_ref("videos-web", "frontend");
    let fetcher = ScriptedFetcher::default().with(&web, web_deployment(1));
    let report = run(fetcher, vec![unit("frontend", web, web_checks())]).await;

    assert!(report.passed());
    let outcomes = assertions_of(&report.results[0]);
    assert_eq!(outcomes.len(), 4);
    assert!(outcomes.iter().all(|o| o.passed));
}

#[tokio::test]
async fn one_mutated_field_yields_exactly_one_failure() {
    let web = deployment_ref("videos-web", "frontend");
    let fetcher = ScriptedFetcher::default().with(&web, web_deployment(0));
    let report = run(fetcher, vec![unit("frontend", web, web_checks())]).await;

    assert!(!report.passed());
    let result = &report.results[0];
    assert_eq!(result.status(), CheckStatus::Failed);
    assert_eq!(assertions_of(result).len(), 4);
    let failures: Vec<_> = result.failed_assertions().collect();
    assert_eq!(failures.len(), 1);
    assert!(
        failures[0]
            .to_string()
            .contains("availableReplicas expected 1, got 0"),
        "{}",
        failures[0]
    );
}

#[tokio::test]
async fn secret_value_mismatch_reports_expected_and_actual() {
    let secret = ResourceRef::new(ResourceKind::Secret, "videos-redis-secret", "microservices")
        .unwrap();
    let fetcher = ScriptedFetcher::default().with(
        &secret,
        json!({ "kind": "Secret", "data": { "PASSWORD": "cmVkaXM=" } }),
    );
    let report = run(
        fetcher,
        vec![unit(
            "redis secret",
            secret,
            vec![
                field("data[\"PASSWORD\"]", Expectation::Equals("redis".into())),
                field("data[\"PASSWORD\"]", Expectation::Equals("wrong".into())),
            ],
        )],
    )
    .await;

    let outcomes = assertions_of(&report.results[0]);
    assert!(outcomes[0].passed);
    assert!(!outcomes[1].passed);
    assert_eq!(
        outcomes[1].expected,
        Expected::Field(Expectation::Equals("wrong".into()))
    );
    assert_eq!(outcomes[1].actual, Actual::Field("redis".into()));

    let json = serde_json::to_value(&outcomes[1]).unwrap();
    assert_eq!(json["expected"], "wrong");
    assert_eq!(json["actual"], "redis");
}

#[test]
fn outcome_values_keep_their_type_in_json() {
    let outcome = AssertionOutcome {
        description: "ports[0].targetPort".to_string(),
        expected: Expected::Field(Expectation::OneOf(vec![80.into(), "http".into()])),
        actual: Actual::Field(FieldValue::Absent),
        passed: false,
    };
    let json = serde_json::to_value(&outcome).unwrap();
    assert_eq!(json["expected"], json!({ "oneOf": [80, "http"] }));
    assert!(json["actual"].is_null());

    let outcome = AssertionOutcome {
        expected: Expected::Field(Expectation::AtLeast(1)),
        actual: Actual::Field(0.into()),
        ..outcome
    };
    let json = serde_json::to_value(&outcome).unwrap();
    assert_eq!(json["expected"], json!({ "atLeast": 1 }));
    assert_eq!(json["actual"], 0);
}

#[test]
fn duplicate_publish_keys_are_rejected_before_any_fetch() {
    let fetcher = Arc::new(ScriptedFetcher::default());
    let a = CheckUnit::builder()
        .name("a")
        .resource(ResourceRef::new(ResourceKind::Service, "a", "default").unwrap())
        .publish(key("svc-a"))
        .build();
    let b = CheckUnit::builder()
        .name("b")
        .resource(ResourceRef::new(ResourceKind::Service, "b", "default").unwrap())
        .publish(key("svc-a"))
        .build();

    let err = Session::new(fetcher.clone(), vec![a, b], SessionOptions::default()).unwrap_err();
    assert_eq!(
        err,
        ConfigurationError::DuplicatePublishKey {
            key: key("svc-a"),
            first: "a".to_string(),
            second: "b".to_string(),
        }
    );
    assert_eq!(fetcher.calls(), 0);
}

#[tokio::test]
async fn not_found_runs_no_assertions() {
    let evaluated = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&evaluated);
    let probe = Assertion::custom("probe", move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
        Verdict {
            passed: true,
            expected: String::new(),
            actual: String::new(),
        }
    });

    let report = run(
        ScriptedFetcher::default(),
        vec![unit("missing", deployment_ref("gone", "frontend"), vec![probe])],
    )
    .await;

    assert_eq!(evaluated.load(Ordering::SeqCst), 0);
    let result = &report.results[0];
    assert_eq!(result.status(), CheckStatus::Failed);
    assert!(matches!(
        result.outcome,
        CheckOutcome::FetchFailed {
            failure: FailureKind::NotFound,
            ..
        }
    ));
    assert!(report.results[0].published.is_none());
}

#[tokio::test]
async fn transport_failure_does_not_stop_the_session() {
    let web = deployment_ref("videos-web", "frontend");
    let api = deployment_ref("videos-api", "microservices");
    let fetcher = ScriptedFetcher::default()
        .with(&web, web_deployment(1))
        .broken(&api);
    let report = run(
        fetcher,
        vec![
            unit("api", api, vec![]),
            unit("frontend", web, web_checks()),
        ],
    )
    .await;

    assert_eq!(report.results.len(), 2);
    assert_eq!(report.results[0].status(), CheckStatus::Error);
    assert_eq!(report.results[1].status(), CheckStatus::Passed);
    assert!(report.has_transport_errors());
    assert!(!report.passed());
}

#[tokio::test]
async fn failed_assertions_still_publish_for_dependents() {
    let web = deployment_ref("videos-web", "frontend");
    let svc = ResourceRef::new(ResourceKind::Service, "videos-web", "frontend").unwrap();
    let fetcher = ScriptedFetcher::default()
        .with(&web, web_deployment(0))
        .with(
            &svc,
            json!({
                "kind": "Service",
                "spec": { "selector": { "app": "videos-web" }, "ports": [{ "port": 80, "targetPort": 80 }] }
            }),
        );
    let deployment = CheckUnit::builder()
        .name("frontend deployment")
        .resource(web)
        .assertions(web_checks())
        .publish(key("videos-web-deployment"))
        .build();
    let service = unit(
        "frontend service",
        svc,
        vec![
            field("ports[0].targetPort", Expectation::Equals(80.into())),
            Assertion::selector_matches(key("videos-web-deployment")),
        ],
    );

    let report = run(fetcher, vec![deployment, service]).await;
    assert_eq!(report.results[0].status(), CheckStatus::Failed);
    assert_eq!(
        report.results[0].published,
        Some(key("videos-web-deployment"))
    );
    assert_eq!(report.results[1].status(), CheckStatus::Passed);
}

#[tokio::test]
async fn publishing_over_an_existing_key_keeps_the_first_snapshot() {
    let web = deployment_ref("videos-web", "frontend");
    let fetcher = ScriptedFetcher::default().with(&web, web_deployment(1));
    let registry = ResultRegistry::new();
    let first = Arc::new(Snapshot::from_value(ResourceKind::Deployment, web_deployment(0)).unwrap());
    registry
        .publish(key("videos-web-deployment"), Arc::clone(&first))
        .unwrap();

    let deployment = CheckUnit::builder()
        .name("frontend deployment")
        .resource(web)
        .assertions(web_checks())
        .publish(key("videos-web-deployment"))
        .build();
    let result = deployment.run(&fetcher, &registry).await;

    assert_eq!(result.status(), CheckStatus::Passed);
    assert!(result.published.is_none());
    let stored = registry.get(&key("videos-web-deployment")).unwrap();
    assert!(Arc::ptr_eq(&stored, &first));
}

#[tokio::test]
async fn unpublished_dependency_is_reported_without_fetching() {
    let web = deployment_ref("videos-web", "frontend");
    let svc = ResourceRef::new(ResourceKind::Service, "videos-web", "frontend").unwrap();
    let fetcher = Arc::new(ScriptedFetcher::default());
    let deployment = CheckUnit::builder()
        .name("frontend deployment")
        .resource(web)
        .publish(key("videos-web-deployment"))
        .build();
    let service = unit(
        "frontend service",
        svc,
        vec![Assertion::selector_matches(key("videos-web-deployment"))],
    );

    let report = Session::new(
        fetcher.clone(),
        vec![deployment, service],
        SessionOptions::default(),
    )
    .unwrap()
    .execute()
    .await;

    assert!(matches!(
        &report.results[1].outcome,
        CheckOutcome::DependencyUnmet { key: k } if *k == key("videos-web-deployment")
    ));
    assert_eq!(report.results[1].status(), CheckStatus::Failed);
    // Only the deployment was fetched.
    assert_eq!(fetcher.calls(), 1);
}

#[test]
fn validation_rejects_bad_dependency_graphs() {
    let web = deployment_ref("videos-web", "frontend");
    let svc = ResourceRef::new(ResourceKind::Service, "videos-web", "frontend").unwrap();
    let env = ResourceRef::new(ResourceKind::ConfigMap, "videos-env", "microservices").unwrap();
    let matches = || vec![Assertion::selector_matches(key("web"))];
    let publisher = |resource: ResourceRef| {
        CheckUnit::builder()
            .name("publisher")
            .resource(resource)
            .publish(key("web"))
            .build()
    };

    let unknown = validate(&[unit("svc", svc.clone(), matches())]).unwrap_err();
    assert!(matches!(unknown, ConfigurationError::UnknownDependency { .. }));

    let misordered =
        validate(&[unit("svc", svc.clone(), matches()), publisher(web.clone())]).unwrap_err();
    assert!(matches!(misordered, ConfigurationError::DependencyOrder { .. }));

    let not_workload =
        validate(&[publisher(env.clone()), unit("svc", svc.clone(), matches())]).unwrap_err();
    assert!(matches!(
        not_workload,
        ConfigurationError::DependencyNotWorkload {
            kind: ResourceKind::ConfigMap,
            ..
        }
    ));

    let no_selector = validate(&[publisher(web.clone()), unit("env", env.clone(), matches())])
        .unwrap_err();
    assert!(matches!(
        no_selector,
        ConfigurationError::SelectorNotApplicable { .. }
    ));

    assert!(validate(&[publisher(web), unit("svc", svc, matches())]).is_ok());
}

#[test]
fn validation_rejects_inapplicable_fields_and_names() {
    let env = ResourceRef::new(ResourceKind::ConfigMap, "videos-env", "microservices").unwrap();
    let err = validate(&[unit(
        "env",
        env.clone(),
        vec![field("status.readyReplicas", Expectation::Equals(1.into()))],
    )])
    .unwrap_err();
    assert_eq!(
        err,
        ConfigurationError::FieldNotApplicable {
            check: "env".to_string(),
            field: "status.readyReplicas".to_string(),
            kind: ResourceKind::ConfigMap,
        }
    );

    let err = validate(&[unit("env", env.clone(), vec![]), unit("env", env.clone(), vec![])])
        .unwrap_err();
    assert_eq!(err, ConfigurationError::DuplicateCheckName("env".to_string()));

    let err = validate(&[unit(" ", env.clone(), vec![])]).unwrap_err();
    assert_eq!(err, ConfigurationError::EmptyCheckName { index: 0 });

    let err = Session::new(
        Arc::new(ScriptedFetcher::default()),
        vec![],
        SessionOptions { max_concurrency: 0 },
    )
    .unwrap_err();
    assert_eq!(err, ConfigurationError::ZeroConcurrency);
}

#[tokio::test]
async fn concurrent_sessions_keep_declaration_order() {
    let refs: Vec<_> = (0..4)
        .map(|i| ResourceRef::new(ResourceKind::ConfigMap, format!("cm-{i}"), "default").unwrap())
        .collect();
    let mut fetcher = ScriptedFetcher::default();
    for (i, r) in refs.iter().enumerate() {
        // Earlier checks take longer to answer.
        fetcher = fetcher
            .with(r, json!({ "kind": "ConfigMap", "data": { "index": i.to_string() } }))
            .slow(r, 8 - 2 * i);
    }
    let fetcher = Arc::new(fetcher);
    let units = refs
        .iter()
        .enumerate()
        .map(|(i, r)| {
            unit(
                &format!("cm {i}"),
                r.clone(),
                vec![field(
                    "data[\"index\"]",
                    Expectation::Equals(i.to_string().into()),
                )],
            )
        })
        .collect();

    let report = Session::new(
        fetcher.clone(),
        units,
        SessionOptions { max_concurrency: 3 },
    )
    .unwrap()
    .execute()
    .await;

    let names: Vec<_> = report.results.iter().map(|r| r.name.as_str()).collect();
    assert_eq!(names, ["cm 0", "cm 1", "cm 2", "cm 3"]);
    assert!(report.passed());
    assert!(fetcher.max_in_flight.load(Ordering::SeqCst) > 1);
}

#[tokio::test]
async fn dependents_wait_for_their_publisher_when_concurrent() {
    let web = deployment_ref("videos-web", "frontend");
    let svc = ResourceRef::new(ResourceKind::Service, "videos-web", "frontend").unwrap();
    let fetcher = ScriptedFetcher::default()
        .with(&web, web_deployment(1))
        .slow(&web, 10)
        .with(
            &svc,
            json!({ "kind": "Service", "spec": { "selector": { "app": "videos-web" } } }),
        );
    let deployment = CheckUnit::builder()
        .name("frontend deployment")
        .resource(web)
        .publish(key("web"))
        .build();
    let service = unit(
        "frontend service",
        svc,
        vec![Assertion::selector_matches(key("web"))],
    );

    let report = Session::new(
        Arc::new(fetcher),
        vec![deployment, service],
        SessionOptions { max_concurrency: 4 },
    )
    .unwrap()
    .execute()
    .await;

    assert!(report.passed(), "{report:#?}");
}

#[tokio::test]
async fn reporters_distinguish_failures_from_errors() {
    let web = deployment_ref("videos-web", "frontend");
    let api = deployment_ref("videos-api", "microservices");
    let fetcher = ScriptedFetcher::default()
        .with(&web, web_deployment(0))
        .broken(&api);
    let report = run(
        fetcher,
        vec![
            unit("frontend <web>", web, web_checks()),
            unit("videos api", api, vec![]),
        ],
    )
    .await;

    let text = TextReporter::default().emit(&report).unwrap();
    assert!(text.contains("FAIL  frontend <web> (Deployment frontend/videos-web)"), "{text}");
    assert!(text.contains("status.availableReplicas expected 1, got 0"), "{text}");
    assert!(text.contains("ERROR videos api"), "{text}");
    assert!(text.contains("0 passed, 1 failed, 1 errors"), "{text}");

    let json: serde_json::Value =
        serde_json::from_str(&JsonReporter.emit(&report).unwrap()).unwrap();
    assert_eq!(json["passed"], false);
    assert_eq!(json["summary"]["errors"], 1);
    assert_eq!(json["checks"][0]["status"], "failed");
    assert_eq!(json["checks"][0]["outcome"]["kind"], "evaluated");
    assert_eq!(json["checks"][1]["outcome"]["failure"], "transport");

    let xml = JunitReporter::default().emit(&report).unwrap();
    assert!(xml.contains("tests=\"2\" failures=\"1\" errors=\"1\""), "{xml}");
    assert!(xml.contains("name=\"frontend &lt;web&gt;\""), "{xml}");
    assert!(xml.contains("<error message=\"failed to fetch"), "{xml}");
}
