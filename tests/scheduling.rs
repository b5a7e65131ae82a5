use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use proptest::prelude::*;
use tasuki::{
    Blueprint, ExecError, ExecutorConfig, Program, ScopedContext, TaskKind, TimeoutBudget,
    TracingExecutor, Value,
};

fn executor() -> &'static TracingExecutor {
    static EXECUTOR: OnceLock<TracingExecutor> = OnceLock::new();
    EXECUTOR.get_or_init(|| {
        TracingExecutor::new(ExecutorConfig {
            workers: 4,
            ..ExecutorConfig::default()
        })
        .unwrap()
    })
}

fn run<T: Send + Sync + 'static>(program: &Program<T>) -> Result<Arc<T>, ExecError> {
    let budget = TimeoutBudget::new(Duration::from_secs(5));
    executor()
        .execute(program, budget, ScopedContext::new())
        .wait_blocking()
}

/// Sets the flag once dropped.
struct DropFlag(Arc<AtomicBool>);

impl Drop for DropFlag {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

fn wait_for(flag: &AtomicBool) -> bool {
    let start = Instant::now();
    while start.elapsed() < Duration::from_secs(2) {
        if flag.load(Ordering::SeqCst) {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    false
}

#[test]
fn chain_runs_as_a_single_task() {
    let mut blueprint = Blueprint::new();
    let a = blueprint.step().name("a").run(|_| Ok(2u64));
    let b = blueprint.step().name("b").depends_on(a).run(|_, a: &u64| Ok(a + 3));
    let c = blueprint.step().name("c").depends_on(b).run(|_, b: &u64| Ok(b * 10));

    let program = blueprint.compile(c).unwrap();
    assert_eq!(program.plan().runs().count(), 1);
    assert_eq!(program.plan().joins().count(), 0);

    let completion = executor().execute(
        &program,
        TimeoutBudget::new(Duration::from_secs(5)),
        ScopedContext::new(),
    );
    let diagnostics = completion.diagnostics().clone();

    assert_eq!(*completion.wait_blocking().unwrap(), 50);
    assert_eq!(diagnostics.joins_fired(), 0);
    assert_eq!(diagnostics.failures(), 0);
}

#[test]
fn fan_in_then_async() {
    let mut blueprint = Blueprint::new();
    let a = blueprint.step().name("A").run(|_| Ok(String::from("left")));
    let b = blueprint.step().name("B").run(|_| Ok(String::from("right")));
    let c = blueprint
        .step()
        .name("C")
        .depends_on((a, b))
        .run(|_, (a, b): (&String, &String)| Ok(format!("{a}+{b}")));
    let d = blueprint
        .step()
        .name("D")
        .depends_on(c)
        .run_async(|_, c: &String| {
            let c = c.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(5)).await;
                Ok::<_, anyhow::Error>(c.len())
            }
        });

    let program = blueprint.compile(d).unwrap();
    let plan = program.plan();

    let root = plan.task(plan.root());
    assert_eq!(root.kind, TaskKind::Fork);
    assert_eq!(root.next.len(), 2);
    assert_eq!(plan.joins().count(), 1);

    let runs: Vec<Vec<_>> = plan.runs().map(|(_, task)| task.steps().to_vec()).collect();
    assert!(runs.contains(&vec![a.source()]));
    assert!(runs.contains(&vec![b.source()]));
    assert!(runs.contains(&vec![c.source()]));
    assert!(runs.contains(&vec![d.source()]));

    let completion = executor().execute(
        &program,
        TimeoutBudget::new(Duration::from_secs(5)),
        ScopedContext::new(),
    );
    let diagnostics = completion.diagnostics().clone();

    assert_eq!(*completion.wait_blocking().unwrap(), "left+right".len());
    assert_eq!(diagnostics.joins_fired(), 1);
}

#[test]
fn diamond_runs_the_shared_step_once() {
    let calls = Arc::new(AtomicU64::new(0));
    let counter = calls.clone();

    let mut blueprint = Blueprint::new();
    let a = blueprint.step().name("a").run(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(1u64)
    });
    let b = blueprint.step().name("b").depends_on(a).run(|_, a: &u64| Ok(a + 1));
    let c = blueprint.step().name("c").depends_on(a).run(|_, a: &u64| Ok(a + 2));
    let d = blueprint
        .step()
        .name("d")
        .depends_on((b, c))
        .run(|_, (b, c): (&u64, &u64)| Ok(b * c));

    let program = blueprint.compile(d).unwrap();
    assert_eq!(*run(&program).unwrap(), 6);
    assert_eq!(*run(&program).unwrap(), 6);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

struct Token(u64);

#[test]
fn concurrent_requests_do_not_share_singletons() {
    static NEXT: AtomicU64 = AtomicU64::new(0);

    let mut blueprint = Blueprint::new();
    let token = |ctx: &tasuki::StepContext| {
        let token = ctx
            .scope()
            .get_or_init(|| Token(NEXT.fetch_add(1, Ordering::SeqCst)));
        Ok::<_, anyhow::Error>(token.0)
    };
    let a = blueprint.step().name("a").run(token);
    let b = blueprint.step().name("b").run(token);
    let both = blueprint
        .step()
        .name("both")
        .depends_on((a, b))
        .run(|_, (a, b): (&u64, &u64)| {
            anyhow::ensure!(a == b, "tokens differ within one request");
            Ok(*a)
        });

    let program = blueprint.compile(both).unwrap();
    let parent = ScopedContext::new();

    let completions: Vec<_> = (0..8)
        .map(|_| {
            let budget = TimeoutBudget::new(Duration::from_secs(5));
            executor().execute(&program, budget, parent.clone())
        })
        .collect();

    let mut seen = HashSet::new();
    for completion in completions {
        let scope = completion.scope().clone();
        let token = completion.wait_blocking().unwrap();
        assert!(seen.insert(*token));
        assert_eq!(scope.constructed(), 1);
    }

    assert_eq!(parent.constructed(), 0);
}

#[test]
fn steps_see_request_bindings() {
    struct Tenant(&'static str);

    let mut blueprint = Blueprint::new();
    let tenant = blueprint.step().run(|ctx| {
        let tenant = ctx.scope().get::<Tenant>();
        let current = tasuki::ExecutionScope::require()?;
        anyhow::ensure!(current.id() == ctx.scope().id(), "step runs outside its scope");
        Ok(tenant.map(|t| t.0))
    });

    let program = blueprint.compile(tenant).unwrap();
    let scope = ScopedContext::builder().bind(Tenant("acme")).build();
    let budget = TimeoutBudget::new(Duration::from_secs(5));

    let out = executor().execute(&program, budget, scope).wait_blocking().unwrap();
    assert_eq!(*out, Some("acme"));
}

#[test]
fn expired_request_drops_in_flight_steps() {
    let dropped = Arc::new(AtomicBool::new(false));
    let flag = dropped.clone();

    let mut blueprint = Blueprint::new();
    let a = blueprint.step().name("a").run(|_| Ok(1u32));
    let slow = blueprint
        .step()
        .name("slow")
        .depends_on(a)
        .run_async(move |_, a: &u32| {
            let a = *a;
            let guard = DropFlag(flag.clone());
            async move {
                let _guard = guard;
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok::<_, anyhow::Error>(a)
            }
        });

    let program = blueprint.compile(slow).unwrap();
    let budget = TimeoutBudget::new(Duration::from_millis(50));
    let completion = executor().execute(&program, budget, ScopedContext::new());
    let diagnostics = completion.diagnostics().clone();

    let start = Instant::now();
    let result = completion.wait_blocking();

    assert!(result.unwrap_err().is_timeout());
    assert!(start.elapsed() < Duration::from_secs(5));
    assert!(diagnostics.timeouts() >= 1);
    assert!(wait_for(&dropped));
}

#[test]
fn failures_propagate_through_joins() {
    let ran = Arc::new(AtomicBool::new(false));
    let flag = ran.clone();

    let mut blueprint = Blueprint::new();
    let a = blueprint.step().name("a").run(|_| Ok(1u32));
    let b = blueprint
        .step()
        .name("b")
        .run(|_| -> anyhow::Result<u32> { anyhow::bail!("disk on fire") });
    let c = blueprint
        .step()
        .name("c")
        .depends_on((a, b))
        .run(move |_, (a, b): (&u32, &u32)| {
            flag.store(true, Ordering::SeqCst);
            Ok(a + b)
        });

    let program = blueprint.compile(c).unwrap();
    let completion = executor().execute(
        &program,
        TimeoutBudget::new(Duration::from_secs(5)),
        ScopedContext::new(),
    );
    let diagnostics = completion.diagnostics().clone();

    match completion.wait_blocking() {
        Err(ExecError::Step(step, err)) => {
            assert_eq!(&*step, "b");
            assert!(err.to_string().contains("disk on fire"));
        }
        other => panic!("unexpected {other:?}"),
    }

    assert!(!ran.load(Ordering::SeqCst));
    assert_eq!(diagnostics.failures(), 1);
    assert_eq!(diagnostics.joins_fired(), 1);
}

#[test]
fn panics_fail_the_request() {
    let mut blueprint = Blueprint::new();
    let a = blueprint
        .step()
        .name("a")
        .run(|_| -> anyhow::Result<u32> { panic!("bad input") });

    let program = blueprint.compile(a).unwrap();
    let err = run(&program).unwrap_err();
    assert!(err.to_string().contains("bad input"));
}

#[test]
fn guarded_steps_refuse_to_start_below_their_minimum() {
    let mut blueprint = Blueprint::new();
    let a = blueprint
        .step()
        .name("a")
        .timeout(Duration::from_secs(1), Duration::from_secs(2))
        .run(|_| Ok(1u32));

    let program = blueprint.compile(a).unwrap();
    let budget = TimeoutBudget::new(Duration::from_millis(100));
    let result = executor()
        .execute(&program, budget, ScopedContext::new())
        .wait_blocking();

    assert!(result.unwrap_err().is_timeout());
}

#[test]
fn guarded_async_steps_time_out_on_their_own_budget() {
    let mut blueprint = Blueprint::new();
    let slow = blueprint
        .step()
        .name("slow")
        .timeout(Duration::ZERO, Duration::from_millis(20))
        .run_async(|_| async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok::<_, anyhow::Error>(1u32)
        });

    let program = blueprint.compile(slow).unwrap();
    let start = Instant::now();
    let err = run(&program).unwrap_err();

    assert!(err.is_timeout());
    assert!(start.elapsed() < Duration::from_secs(5));
}

#[test]
fn guarded_sync_steps_time_out_on_their_own_budget() {
    let mut blueprint = Blueprint::new();
    let slow = blueprint
        .step()
        .name("slow")
        .timeout(Duration::ZERO, Duration::from_millis(30))
        .run(|_| {
            std::thread::sleep(Duration::from_millis(400));
            Ok(1u32)
        });

    let program = blueprint.compile(slow).unwrap();
    let completion = executor().execute(
        &program,
        TimeoutBudget::new(Duration::from_secs(5)),
        ScopedContext::new(),
    );
    let diagnostics = completion.diagnostics().clone();

    let start = Instant::now();
    let err = completion.wait_blocking().unwrap_err();

    assert!(err.is_timeout());
    assert!(start.elapsed() < Duration::from_millis(200));
    assert_eq!(diagnostics.timeouts(), 1);
}

#[test]
fn cancelled_requests_complete_with_cancelled() {
    let mut blueprint = Blueprint::new();
    let pending = blueprint
        .step()
        .name("pending")
        .run_async(|_| std::future::pending::<anyhow::Result<u32>>());

    let program = blueprint.compile(pending).unwrap();
    let completion = executor().execute(
        &program,
        TimeoutBudget::new(Duration::from_secs(5)),
        ScopedContext::new(),
    );

    completion.cancel();
    assert!(matches!(completion.wait_blocking(), Err(ExecError::Cancelled)));
}

#[tokio::test]
async fn completions_can_be_awaited() {
    let mut blueprint = Blueprint::new();
    let a = blueprint.step().run(|_| Ok(String::from("hello")));
    let program = blueprint.compile(a).unwrap();

    let budget = TimeoutBudget::new(Duration::from_secs(5));
    let out = executor()
        .execute(&program, budget, ScopedContext::new())
        .wait()
        .await
        .unwrap();

    assert_eq!(out.as_str(), "hello");
}

#[test]
fn diagnostics_render_the_request() {
    let mut blueprint = Blueprint::new();
    let a = blueprint.step().name("a").run(|_| Ok(1u32));
    let b = blueprint.step().name("b").run(|_| Ok(2u32));
    let c = blueprint
        .step()
        .name("c")
        .depends_on((a, b))
        .run(|_, (a, b): (&u32, &u32)| Ok(a + b));

    let program = blueprint.compile(c).unwrap();
    let completion = executor().execute(
        &program,
        TimeoutBudget::new(Duration::from_secs(5)),
        ScopedContext::new(),
    );
    let diagnostics = completion.diagnostics().clone();
    completion.wait_blocking().unwrap();

    let rendered = diagnostics.render_mermaid(&program);
    assert!(rendered.starts_with("graph LR\n"));
    assert!(rendered.contains("style "));
    assert!(rendered.contains("%% timeouts: 0, failures: 0"));
}

type Dag = Vec<(Vec<usize>, bool)>;

/// Random DAG in topological order: step `i` depends on a subset of the
/// steps before it and may be asynchronous.
fn dag() -> impl Strategy<Value = Dag> {
    (1usize..10).prop_flat_map(|n| {
        (0..n)
            .map(|i| {
                (proptest::collection::vec(any::<bool>(), i), any::<bool>()).prop_map(
                    |(mask, is_async)| {
                        let deps = mask
                            .iter()
                            .enumerate()
                            .filter_map(|(j, &b)| b.then_some(j))
                            .collect();
                        (deps, is_async)
                    },
                )
            })
            .collect::<Vec<_>>()
    })
}

fn combine(i: usize, deps: &[u64]) -> u64 {
    deps.iter()
        .enumerate()
        .fold(i as u64 * 31 + 1, |acc, (k, v)| {
            acc.wrapping_mul(7).wrapping_add(v ^ k as u64)
        })
}

fn sequential(dag: &Dag) -> Vec<u64> {
    let mut values: Vec<u64> = Vec::with_capacity(dag.len());
    for (i, (deps, _)) in dag.iter().enumerate() {
        let inputs: Vec<u64> = deps.iter().map(|&j| values[j]).collect();
        values.push(combine(i, &inputs));
    }
    values
}

fn reachable(dag: &Dag) -> HashSet<usize> {
    let mut seen = HashSet::new();
    let mut stack = vec![dag.len() - 1];
    while let Some(i) = stack.pop() {
        if seen.insert(i) {
            stack.extend(dag[i].0.iter().copied());
        }
    }
    seen
}

fn compile(dag: &Dag) -> (Program<u64>, Vec<Value<u64>>) {
    let mut blueprint = Blueprint::new();
    let mut values: Vec<Value<u64>> = Vec::with_capacity(dag.len());

    for (i, (deps, is_async)) in dag.iter().enumerate() {
        let inputs: Vec<Value<u64>> = deps.iter().map(|&j| values[j]).collect();
        let step = blueprint.step().name(format!("s{i}")).depends_on(inputs);

        let value = if *is_async {
            step.run_async(move |_, deps: Vec<&u64>| {
                let out = combine(i, &deps.into_iter().copied().collect::<Vec<_>>());
                async move { Ok::<_, anyhow::Error>(out) }
            })
        } else {
            step.run(move |_, deps: Vec<&u64>| {
                Ok(combine(i, &deps.into_iter().copied().collect::<Vec<_>>()))
            })
        };

        values.push(value);
    }

    let terminal = values[dag.len() - 1];
    (blueprint.compile(terminal).unwrap(), values)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn planned_execution_matches_sequential_evaluation(dag in dag()) {
        let (program, _) = compile(&dag);
        let expected = sequential(&dag)[dag.len() - 1];

        prop_assert_eq!(*run(&program).unwrap(), expected);
    }

    #[test]
    fn every_reachable_step_runs_in_exactly_one_task(dag in dag()) {
        let (program, values) = compile(&dag);
        let wanted: HashSet<_> = reachable(&dag).into_iter().map(|i| values[i].source()).collect();

        let planned: Vec<_> = program
            .plan()
            .runs()
            .flat_map(|(_, task)| task.steps().to_vec())
            .collect();
        let unique: HashSet<_> = planned.iter().copied().collect();

        prop_assert_eq!(planned.len(), unique.len());
        prop_assert_eq!(unique, wanted);
    }
}
