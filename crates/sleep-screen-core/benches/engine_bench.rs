use criterion::{criterion_group, criterion_main, Criterion};
use serde_json::{json, Value};
use sleep_screen_core::{knowledge_base, normalize, raw_input, screen, InferenceEngine, RawInput};

fn mk_input(index: usize) -> RawInput {
    let categories = ["Normal", "Overweight", "Obese", "Normal Weight"];
    let value: Value = json!({
        "age": 25 + index % 50,
        "sleepDuration": 4.0 + (index % 6) as f64,
        "sleepQuality": index % 10,
        "stressLevel": (index * 7) % 10,
        "physicalActivity": (index * 13) % 90,
        "bmiCategory": categories[index % categories.len()],
        "bloodPressure": format!("{}/{}", 110 + index % 50, 70 + index % 30),
    });
    match raw_input(value) {
        Ok(input) => input,
        Err(err) => panic!("benchmark fixture must be an object: {err}"),
    }
}

fn bench_screen(c: &mut Criterion) {
    let inputs = (0..1_000).map(mk_input).collect::<Vec<_>>();

    c.bench_function("screen_1000_sessions", |b| {
        b.iter(|| {
            for input in &inputs {
                if let Err(err) = screen(input) {
                    panic!("screening benchmark failed: {err}");
                }
            }
        });
    });
}

fn bench_engine(c: &mut Criterion) {
    let facts = (0..1_000).map(|index| normalize(&mk_input(index))).collect::<Vec<_>>();
    let engine = InferenceEngine::new(knowledge_base());

    c.bench_function("inference_fixpoint_1000_fact_sets", |b| {
        b.iter(|| {
            for fact_set in &facts {
                let run = engine.run(fact_set.clone());
                if run.capped {
                    panic!("engine benchmark hit the pass ceiling");
                }
            }
        });
    });
}

criterion_group!(engine_benches, bench_screen, bench_engine);
criterion_main!(engine_benches);
