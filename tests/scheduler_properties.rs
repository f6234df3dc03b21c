use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};

use automa::{
    worker_fn, ArgsBinding, Arguments, Automa, AutomaError, AutomaEvent, GlobalSettings,
    InteractionFeedback, Param, Signature, SuppressErrors, SystemRef, WorkerContext, WorkerNode,
};
use automa_test_utils::{
    constant, echo, failing_with, interacting, ExecutionLog, RecordingCallback, ScopeRecorder,
};

#[derive(Debug, thiserror::Error)]
#[error("value error: {0}")]
struct ValueError(String);

fn sleeper(ms: u64, value: Value) -> impl automa::Worker {
    worker_fn(move |_ctx, _args| {
        let value = value.clone();
        async move {
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok(value)
        }
    })
    .params(&[])
}

fn steps_of(rx: &mut tokio::sync::broadcast::Receiver<AutomaEvent>, automa: &str) -> Vec<Vec<String>> {
    let mut steps = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if let AutomaEvent::StepStarted {
            automa: name,
            workers,
            ..
        } = event
        {
            if name == automa {
                steps.push(workers);
            }
        }
    }
    steps
}

#[tokio::test]
async fn test_example_scenario_hello_world() {
    let step2 = worker_fn(|_ctx, args: Arguments| async move {
        let first = args.get_str("step1").unwrap_or_default().to_string();
        Ok(json!(format!("{} world", first)))
    })
    .params(&["step1"]);

    let automa = Automa::builder("hello")
        .worker(WorkerNode::new("step1", constant(json!("hello"))).start())
        .worker(WorkerNode::new("step2", step2).depends_on(["step1"]).output())
        .build()
        .unwrap();

    assert_eq!(
        automa.run(Arguments::new()).await.unwrap(),
        json!("hello world")
    );
}

#[tokio::test]
async fn test_example_scenario_dynamic_step1b() {
    let log = ExecutionLog::new();
    let step1b_worker = log.recording("step1b", json!("side"));
    let step1b = Arc::new(Mutex::new(Some(WorkerNode::new("step1b", step1b_worker))));

    let step1 = {
        let log = log.clone();
        worker_fn(move |ctx: WorkerContext, _args| {
            let log = log.clone();
            let pending = step1b.lock().unwrap().take();
            async move {
                log.push("step1");
                if let Some(node) = pending {
                    ctx.add_worker(node)?;
                    ctx.ferry_to("step1b", Arguments::new())?;
                }
                Ok(json!("hello"))
            }
        })
        .params(&[])
    };
    let step2 = {
        let log = log.clone();
        worker_fn(move |_ctx, args: Arguments| {
            let log = log.clone();
            async move {
                log.push("step2");
                Ok(json!(format!("{} world", args.get_str("x").unwrap_or_default())))
            }
        })
        .params(&["x"])
    };

    let automa = Automa::builder("hello")
        .worker(WorkerNode::new("step1", step1).start())
        .worker(WorkerNode::new("step2", step2).depends_on(["step1"]).output())
        .build()
        .unwrap();
    let mut rx = automa.subscribe();

    let out = automa.run(Arguments::new()).await.unwrap();
    assert_eq!(out, json!("hello world"));

    // step1b runs in the step right after step1, alongside step2.
    let steps = steps_of(&mut rx, "hello");
    assert_eq!(steps.len(), 2);
    assert_eq!(steps[0], vec!["step1"]);
    assert!(steps[1].contains(&"step1b".to_string()));
    assert!(steps[1].contains(&"step2".to_string()));
    assert_eq!(log.count("step1b"), 1);
    assert!(automa.worker_keys().contains(&"step1b".to_string()));
}

#[tokio::test]
async fn test_and_join_waits_for_every_predecessor() {
    let log = ExecutionLog::new();
    let join = {
        let log = log.clone();
        worker_fn(move |_ctx, args: Arguments| {
            let log = log.clone();
            async move {
                log.push("join");
                Ok(json!([args.get("a"), args.get("b")]))
            }
        })
        .params(&["a", "b"])
    };

    // a completes in the first step, b only in the second.
    let automa = Automa::builder("and-join")
        .worker(WorkerNode::new("a", log.recording("a", json!(1))).start())
        .worker(WorkerNode::new("pre", log.recording("pre", json!(0))).start())
        .worker(WorkerNode::new("b", log.recording("b", json!(2))).depends_on(["pre"]))
        .worker(WorkerNode::new("join", join).depends_on(["a", "b"]).output())
        .build()
        .unwrap();
    let mut rx = automa.subscribe();

    let out = automa.run(Arguments::new()).await.unwrap();
    assert_eq!(out, json!([1, 2]));
    assert_eq!(log.count("join"), 1);
    assert!(log.position("join") > log.position("b"));

    let steps = steps_of(&mut rx, "and-join");
    assert_eq!(steps.len(), 3);
    assert_eq!(steps[2], vec!["join"]);
}

#[tokio::test]
async fn test_redirection_bypasses_dependencies() {
    let log = ExecutionLog::new();
    let jumper = {
        let log = log.clone();
        worker_fn(move |ctx: WorkerContext, _args| {
            let log = log.clone();
            async move {
                log.push("start");
                ctx.ferry_to("target", Arguments::new().with_arg("ferried"))?;
                Ok(Value::Null)
            }
        })
        .params(&[])
    };

    // target depends on a worker that never runs.
    let automa = Automa::builder("ferry")
        .worker(WorkerNode::new("start", jumper).start())
        .worker(WorkerNode::new("never", log.recording("never", json!(0))))
        .worker(WorkerNode::new("target", echo()).depends_on(["never"]).output())
        .build()
        .unwrap();
    let mut rx = automa.subscribe();

    let out = automa.run(Arguments::new()).await.unwrap();
    assert_eq!(out, json!("ferried"));
    assert_eq!(log.count("never"), 0);
    assert_eq!(steps_of(&mut rx, "ferry"), vec![vec!["start"], vec!["target"]]);
}

#[tokio::test]
async fn test_add_dependency_is_idempotent() {
    let automa = Automa::builder("edges")
        .worker(WorkerNode::new("a", constant(json!(1))).start())
        .worker(WorkerNode::new("b", echo()).output())
        .build()
        .unwrap();

    automa.add_dependency("b", "a").unwrap();
    automa.add_dependency("b", "a").unwrap();
    assert_eq!(automa.dependencies_of("b"), Some(vec!["a".to_string()]));

    // b still receives exactly one upstream value.
    assert_eq!(automa.run(Arguments::new()).await.unwrap(), json!(1));
}

#[tokio::test]
async fn test_merge_order_ignores_arrival_order() {
    for (a_ms, b_ms) in [(30, 0), (0, 30)] {
        let automa = Automa::builder("merge")
            .worker(WorkerNode::new("a", sleeper(a_ms, json!("A"))).start())
            .worker(WorkerNode::new("b", sleeper(b_ms, json!("B"))).start())
            .worker(
                WorkerNode::new("m", echo())
                    .depends_on(["a", "b"])
                    .binding(ArgsBinding::Merge)
                    .output(),
            )
            .build()
            .unwrap();
        assert_eq!(automa.run(Arguments::new()).await.unwrap(), json!(["A", "B"]));
    }
}

fn doubler() -> impl automa::Worker {
    worker_fn(|_ctx, args: Arguments| async move {
        let x = args.arg(0).and_then(Value::as_i64).unwrap_or(0);
        Ok(json!(x * 2))
    })
}

#[tokio::test]
async fn test_suspension_round_trip_is_transparent() {
    let interactive = Automa::builder("interactive")
        .worker(WorkerNode::new("ask", interacting("number")).start())
        .worker(WorkerNode::new("double", doubler()).depends_on(["ask"]).output())
        .build()
        .unwrap();
    let precomputed = Automa::builder("precomputed")
        .worker(WorkerNode::new("ask", constant(json!(21))).start())
        .worker(WorkerNode::new("double", doubler()).depends_on(["ask"]).output())
        .build()
        .unwrap();

    let signal = interactive
        .run(Arguments::new())
        .await
        .unwrap_err()
        .into_interaction()
        .unwrap();
    assert_eq!(signal.interactions.len(), 1);
    assert_eq!(signal.interactions[0].worker_key, "ask");
    assert_eq!(
        signal.interactions[0].event.event_type.as_deref(),
        Some("number")
    );
    assert!(signal.snapshot.is_some());

    let resumed = interactive
        .resume(vec![InteractionFeedback::new(signal.ids()[0].clone(), 21)])
        .await
        .unwrap();
    let direct = precomputed.run(Arguments::new()).await.unwrap();
    assert_eq!(resumed, direct);
    assert_eq!(resumed, json!(42));
}

fn suppression_automa(suppress: bool) -> Automa {
    let consumer = worker_fn(|_ctx, args: Arguments| async move {
        Ok(json!({ "upstream_was_null": args.arg(0).map_or(true, Value::is_null) }))
    });
    let mut builder = Automa::builder("suppress")
        .worker(
            WorkerNode::new(
                "parse",
                failing_with(|| ValueError("not a number".to_string())),
            )
            .start(),
        )
        .worker(WorkerNode::new("consume", consumer).depends_on(["parse"]).output());
    if suppress {
        builder = builder.callback(Arc::new(SuppressErrors::<ValueError>::new()));
    }
    builder.build().unwrap()
}

#[tokio::test]
async fn test_error_suppression_by_type() {
    let out = suppression_automa(true).run(Arguments::new()).await.unwrap();
    assert_eq!(out, json!({ "upstream_was_null": true }));

    let err = suppression_automa(false)
        .run(Arguments::new())
        .await
        .unwrap_err();
    assert_eq!(err.worker_key(), Some("parse"));
    assert_eq!(err.find::<ValueError>().map(|e| e.0.as_str()), Some("not a number"));
}

#[tokio::test]
async fn test_suppressor_ignores_other_error_types() {
    let automa = Automa::builder("other")
        .callback(Arc::new(SuppressErrors::<ValueError>::new()))
        .worker(WorkerNode::new("boom", automa_test_utils::failing("io broke")).start())
        .build()
        .unwrap();
    let err = automa.run(Arguments::new()).await.unwrap_err();
    assert!(matches!(err, AutomaError::WorkerExecution { .. }));
}

fn chain_of_adders(name: &str) -> Automa {
    let add = |n: i64| {
        worker_fn(move |_ctx, args: Arguments| async move {
            let x = args.arg(0).and_then(Value::as_i64).unwrap_or(0);
            Ok(json!(x + n))
        })
    };
    automa::sequential(
        name,
        vec![WorkerNode::new("plus1", add(1)), WorkerNode::new("plus10", add(10))],
    )
    .unwrap()
}

#[tokio::test]
async fn test_nesting_is_transparent() {
    let standalone = chain_of_adders("inner")
        .run(Arguments::positional(vec![json!(5)]))
        .await
        .unwrap();

    let parent = Automa::builder("outer")
        .worker(WorkerNode::new("inner", chain_of_adders("inner")).start().output())
        .build()
        .unwrap();
    let nested = parent
        .run(Arguments::positional(vec![json!(5)]))
        .await
        .unwrap();

    assert_eq!(standalone, json!(16));
    assert_eq!(nested, standalone);
}

#[tokio::test]
async fn test_nested_failure_is_wrapped_under_parent_key() {
    let child = Automa::builder("child")
        .worker(
            WorkerNode::new("parse", failing_with(|| ValueError("bad".to_string()))).start(),
        )
        .build()
        .unwrap();
    let parent = Automa::builder("parent")
        .worker(WorkerNode::new("sub", child).start())
        .build()
        .unwrap();

    let err = parent.run(Arguments::new()).await.unwrap_err();
    assert_eq!(err.worker_key(), Some("sub"));
    assert!(err.find::<ValueError>().is_some());
}

#[tokio::test]
async fn test_callbacks_fire_global_then_automa_then_worker() {
    let events = Arc::new(Mutex::new(Vec::new()));
    let settings = Arc::new(
        GlobalSettings::new().with_callback(Arc::new(RecordingCallback::new("global", events.clone()))),
    );
    let automa = Automa::builder("hooks")
        .settings(settings)
        .callback(Arc::new(RecordingCallback::new("automa", events.clone())))
        .worker(
            WorkerNode::new("a", constant(json!(1)))
                .start()
                .output()
                .callback(Arc::new(RecordingCallback::new("worker", events.clone()))),
        )
        .build()
        .unwrap();

    automa.run(Arguments::new()).await.unwrap();
    assert_eq!(
        *events.lock().unwrap(),
        vec![
            "global:start:a",
            "automa:start:a",
            "worker:start:a",
            "global:end:a",
            "automa:end:a",
            "worker:end:a",
        ]
    );
}

#[tokio::test]
async fn test_interaction_never_reaches_error_hooks() {
    let events = Arc::new(Mutex::new(Vec::new()));
    let automa = Automa::builder("hooks")
        .callback(Arc::new(
            RecordingCallback::new("automa", events.clone()).suppressing(),
        ))
        .worker(WorkerNode::new("ask", interacting("confirm")).start().output())
        .build()
        .unwrap();

    let err = automa.run(Arguments::new()).await.unwrap_err();
    assert!(err.is_interaction());
    assert_eq!(*events.lock().unwrap(), vec!["automa:start:ask"]);
}

#[tokio::test]
async fn test_callback_sees_nesting() {
    let recorder = Arc::new(ScopeRecorder::default());
    let settings = Arc::new(GlobalSettings::new().with_callback(recorder.clone()));

    let child = Automa::builder("child")
        .settings(settings.clone())
        .worker(WorkerNode::new("leaf", constant(json!(1))).start().output())
        .build()
        .unwrap();
    let parent = Automa::builder("parent")
        .settings(settings)
        .worker(WorkerNode::new("sub", child).start().output())
        .build()
        .unwrap();

    assert_eq!(parent.run(Arguments::new()).await.unwrap(), json!(1));
    let seen = recorder.seen.lock().unwrap().clone();
    assert_eq!(
        seen,
        vec![
            ("sub".to_string(), true, "parent".to_string()),
            ("leaf".to_string(), false, "child".to_string()),
        ]
    );
}

#[tokio::test]
async fn test_injection_and_keyword_inputs() {
    let report = worker_fn(|_ctx, args: Arguments| async move {
        Ok(json!({
            "seed": args.get("seed"),
            "me": args.get("me"),
            "owner": args.get("owner"),
            "mode": args.get("mode"),
        }))
    })
    .with_signature(
        Signature::new()
            .param(Param::from_worker("seed", "seed"))
            .param(Param::system("me", SystemRef::WorkerKey))
            .param(Param::system("owner", SystemRef::AutomaName))
            .param(Param::new("mode").with_default("fast")),
    );

    let automa = Automa::builder("inject")
        .worker(WorkerNode::new("seed", constant(json!(7))).start())
        .worker(
            WorkerNode::new("report", report)
                .depends_on(["seed"])
                .binding(ArgsBinding::Suppressed)
                .output(),
        )
        .build()
        .unwrap();

    let out = automa
        .run(Arguments::new().with_kwarg("mode", "slow"))
        .await
        .unwrap();
    assert_eq!(
        out,
        json!({ "seed": 7, "me": "report", "owner": "inject", "mode": "slow" })
    );
}

#[tokio::test]
async fn test_missing_argument_aborts_run() {
    let needs_two = worker_fn(|_ctx, _args| async move { Ok(Value::Null) }).params(&["a", "b"]);
    let automa = Automa::builder("mapping")
        .worker(WorkerNode::new("a", constant(json!(1))).start())
        .worker(WorkerNode::new("b", needs_two).depends_on(["a"]))
        .build()
        .unwrap();

    let err = automa.run(Arguments::new()).await.unwrap_err();
    assert!(matches!(err, AutomaError::ArgsMapping { ref key, .. } if key == "b"));
}

#[tokio::test]
async fn test_multiple_outputs_in_declaration_order() {
    let automa = Automa::builder("outputs")
        .worker(WorkerNode::new("x", constant(json!("x"))).start().output())
        .worker(WorkerNode::new("y", sleeper(10, json!("y"))).start().output())
        .build()
        .unwrap();
    assert_eq!(automa.run(Arguments::new()).await.unwrap(), json!(["x", "y"]));
}
