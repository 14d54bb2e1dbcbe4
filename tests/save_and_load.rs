mod common;

use rusty_chain::{
    a_funcs::{ReLU, TanH},
    layers::{
        ActivationBuilder, BatchNormBuilder, DenseBuilder, DropoutBuilder, EmbeddingBuilder,
        RecurrentBuilder, SoftmaxBuilder,
    },
    loss::MeanSquared,
    network::{LinearBuilder, Network},
    optimizer::{Adam, GradientDescent},
    trainer::Data,
};

#[test]
fn save_and_load() -> anyhow::Result<()> {
    let mut network = LinearBuilder::new(3)
        .seed(11)
        .layer(DenseBuilder::new(6))
        .layer(BatchNormBuilder::new())
        .layer(ActivationBuilder::new(ReLU))
        .layer(DropoutBuilder::new(0.25))
        .layer(DenseBuilder::new(2))
        .build()?;

    // train a little so the weights and running statistics move away from their defaults
    let data: Vec<_> = (0..16)
        .map(|i| {
            let x = i as f64 / 8. - 1.;
            Data::new([x, x * x, -x], [x.sin(), x.cos()])
        })
        .collect();
    network.fit(&data, 5, 4, &mut GradientDescent::new(0.05), &MeanSquared)?;

    let path = common::temp_file("dense");
    network.save(&path)?;
    let mut loaded = Network::load(&path)?;
    std::fs::remove_file(&path)?;

    assert_eq!(loaded.in_size(), 3);
    assert_eq!(loaded.param_count(), network.param_count());
    common::assert_close(&loaded.params(), &network.params());
    for d in &data {
        common::assert_close(&loaded.predict(&d.input)?, &network.predict(&d.input)?);
    }
    Ok(())
}

#[test]
fn save_and_load_sequence_model() -> anyhow::Result<()> {
    let mut network = LinearBuilder::new(4)
        .seed(2)
        .layer(EmbeddingBuilder::new(6, 3).seq_len(4))
        .layer(RecurrentBuilder::lstm(5, 4))
        .layer(ActivationBuilder::new(TanH))
        .layer(DenseBuilder::new(3))
        .layer(SoftmaxBuilder::new())
        .build()?;

    let data = vec![
        Data::new([0., 1., 2., 3.], [1., 0., 0.]),
        Data::new([5., 4., 3., 2.], [0., 1., 0.]),
        Data::new([1., 1., 1., 1.], [0., 0., 1.]),
    ];
    network.fit(&data, 3, 2, &mut Adam::builder().build(), &MeanSquared)?;

    let path = common::temp_file("sequence");
    network.save(&path)?;
    let mut loaded = Network::load(&path)?;
    std::fs::remove_file(&path)?;

    for d in &data {
        let out = loaded.predict(&d.input)?;
        common::assert_close(&out, &network.predict(&d.input)?);
        approx::assert_relative_eq!(out.iter().sum::<f64>(), 1., epsilon = 1e-9);
    }
    Ok(())
}

#[test]
fn load_rejects_broken_files() {
    let path = common::temp_file("broken");
    std::fs::write(&path, "{\"in_size\": 2}").unwrap();
    assert!(Network::load(&path).is_err());
    std::fs::remove_file(&path).unwrap();
    assert!(Network::load(&path).is_err());
}
