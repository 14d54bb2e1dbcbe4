use criterion::{black_box, criterion_group, criterion_main, Criterion};
use rusty_chain::{
    a_funcs::Sigmoid,
    batch::Batch,
    layers::{ActivationBuilder, DenseBuilder, RecurrentBuilder},
    loss::MeanSquared,
    network::LinearBuilder,
    optimizer::GradientDescent,
    trainer::Data,
};

fn training_speed(c: &mut Criterion) {
    let batch_size = 100;
    let data = vec![Data::new([0.], [0.]); 100];

    let mut network = LinearBuilder::new(1)
        .layer(DenseBuilder::new(100))
        .layer(ActivationBuilder::new(Sigmoid))
        .layer(DenseBuilder::new(100))
        .layer(ActivationBuilder::new(Sigmoid))
        .layer(DenseBuilder::new(1))
        .layer(ActivationBuilder::new(Sigmoid))
        .build()
        .unwrap();
    let mut optimizer = GradientDescent::new(0.1);

    c.bench_function("dense_epoch", |b| {
        b.iter(|| {
            network
                .fit(black_box(&data), 1, batch_size, &mut optimizer, &MeanSquared)
                .unwrap()
        })
    });
}

fn recurrent_forward(c: &mut Criterion) {
    let mut group = c.benchmark_group("lstm_forward");
    for batch in [1, 16, 128] {
        let mut network = LinearBuilder::new(8 * 10)
            .layer(RecurrentBuilder::lstm(32, 10))
            .build()
            .unwrap();
        let input = Batch::new((0..batch).map(|i| vec![i as f64 / batch as f64; 80]));
        group.bench_function(format!("batch_{}", batch), |b| {
            b.iter(|| network.predict_batch(black_box(&input)).unwrap())
        });
    }
    group.finish();
}

criterion_group!(benches, training_speed, recurrent_forward);
criterion_main!(benches);
