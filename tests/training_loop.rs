//! End-to-end training behavior: robustness gains, NaN containment, and
//! checkpoint preservation.

use adversarial_trainer_rs::metrics::VecRecorder;
use adversarial_trainer_rs::models::{LinearClassifier, Sgd};
use adversarial_trainer_rs::prelude::*;
use ndarray::ArrayD;

/// Two mirrored classes separated robustly only by the first feature.
/// The second feature has larger magnitude for most points but sits
/// inside the attack radius for the rest, so a model leaning on it loses
/// robust accuracy until adversarial training weans it off.
fn fragile_feature_dataset() -> InMemoryDataset {
    let class1_rows: [(f32, f32); 6] = [
        (1.0, 2.5),
        (1.0, 2.5),
        (1.0, 2.5),
        (1.0, 0.2),
        (1.0, 0.2),
        (1.0, -0.2),
    ];
    let mut values = Vec::with_capacity(24);
    let mut labels = Vec::with_capacity(12);
    for &(a, b) in &class1_rows {
        values.extend([a, b]);
        labels.push(1);
    }
    for &(a, b) in &class1_rows {
        values.extend([-a, -b]);
        labels.push(0);
    }
    let inputs = ArrayD::from_shape_vec(vec![12, 2], values).unwrap();
    InMemoryDataset::new(inputs, labels, 12).unwrap()
}

fn robust_training_config() -> TrainerConfig {
    let constraint = ConstraintSpec::new(NormKind::Linf, 0.6, (-100.0, 100.0)).unwrap();
    TrainerConfig::builder()
        .attack(AttackConfig::pgd(constraint, 0.3, 5))
        .eval_attack(AttackConfig::pgd(constraint, 0.2, 20))
        .mix(BatchMix::Always)
        .clean_weight(0.0)
        .robust_weight(1.0)
        .seed(0)
        .build()
}

/// Always-adversarial training on linearly separable data: robust
/// accuracy at the constraint radius must strictly improve from the
/// first epoch to the second.
#[test]
fn robust_accuracy_strictly_increases_across_epochs() {
    let dataset = fragile_feature_dataset();
    let mut trainer = AdversarialTrainer::new(
        LinearClassifier::new(2, 2),
        Sgd::new(2.0),
        robust_training_config(),
    )
    .unwrap();
    let mut recorder = VecRecorder::default();

    trainer.run_epoch(&dataset, &mut recorder).unwrap();
    trainer.run_epoch(&dataset, &mut recorder).unwrap();

    let (_, _, robust_epoch_1) = recorder.rows[0];
    let (_, _, robust_epoch_2) = recorder.rows[1];
    assert!(
        robust_epoch_2 > robust_epoch_1,
        "robust accuracy did not improve: {robust_epoch_1} -> {robust_epoch_2}"
    );
    assert!(
        (trainer.state().best_robust_accuracy - robust_epoch_2).abs() < 1e-6,
        "best robust accuracy not tracked"
    );
}

#[test]
fn clean_accuracy_reaches_separable_optimum() {
    let dataset = fragile_feature_dataset();
    let mut trainer = AdversarialTrainer::new(
        LinearClassifier::new(2, 2),
        Sgd::new(2.0),
        robust_training_config(),
    )
    .unwrap();
    let mut recorder = VecRecorder::default();
    for _ in 0..3 {
        trainer.run_epoch(&dataset, &mut recorder).unwrap();
    }
    let (_, clean, _) = *recorder.rows.last().unwrap();
    assert!(
        (clean - 1.0).abs() < 1e-6,
        "separable data should classify cleanly, got {clean}"
    );
}

fn nan_dataset(batches: usize) -> InMemoryDataset {
    let n = batches * 2;
    let inputs = ArrayD::from_shape_vec(vec![n, 2], vec![f32::NAN; n * 2]).unwrap();
    let labels = (0..n).map(|i| i % 2).collect();
    InMemoryDataset::new(inputs, labels, 2).unwrap()
}

/// Three consecutive NaN-loss batches abort the run with a numerical
/// error while the last checkpoint reference survives.
#[test]
fn consecutive_nan_batches_abort_and_preserve_checkpoint() {
    let dir = tempfile::tempdir().unwrap();
    let constraint = ConstraintSpec::new(NormKind::Linf, 0.1, (-100.0, 100.0)).unwrap();
    let config = TrainerConfig::builder()
        .attack(AttackConfig::fgsm(constraint, 0.1))
        .checkpoint(adversarial_trainer_rs::config::CheckpointPolicy {
            interval_epochs: 1,
            keep_last_n: 2,
            prefix: "abort_test".to_string(),
        })
        .build();
    let mut trainer =
        AdversarialTrainer::new(LinearClassifier::new(2, 2), Sgd::new(0.1), config).unwrap();
    trainer.enable_checkpointing(dir.path()).unwrap();
    let mut recorder = VecRecorder::default();

    // A healthy epoch writes the checkpoint that must survive the abort.
    let healthy = fragile_feature_dataset();
    trainer.run_epoch(&healthy, &mut recorder).unwrap();
    let saved = trainer.last_checkpoint().unwrap().to_path_buf();
    assert!(saved.exists());

    let err = trainer
        .run_epoch(&nan_dataset(3), &mut recorder)
        .unwrap_err();
    assert!(
        matches!(err, TrainError::Numerical { .. }),
        "wrong abort kind: {err}"
    );
    assert_eq!(trainer.last_checkpoint().unwrap(), saved.as_path());
    assert!(saved.exists(), "checkpoint lost during abort");
}

/// A single NaN batch inside an otherwise healthy epoch is skipped, not
/// fatal, and does not step the optimizer.
#[test]
fn isolated_nan_batches_are_skipped() {
    let constraint = ConstraintSpec::new(NormKind::Linf, 0.1, (-100.0, 100.0)).unwrap();
    let config = TrainerConfig::builder()
        .attack(AttackConfig::fgsm(constraint, 0.1))
        .build();
    let mut trainer =
        AdversarialTrainer::new(LinearClassifier::new(2, 2), Sgd::new(0.1), config).unwrap();

    let healthy = fragile_feature_dataset();
    let good_batch = healthy.epoch_batches(0).next().unwrap();
    let bad_batch = nan_dataset(1).epoch_batches(0).next().unwrap();

    assert!(!trainer.step(&good_batch).unwrap().skipped);
    let step_before = trainer.state().step;
    assert!(trainer.step(&bad_batch).unwrap().skipped);
    assert_eq!(trainer.state().step, step_before);
    // recovery: the failure run resets on the next healthy batch
    assert!(!trainer.step(&good_batch).unwrap().skipped);
}

#[test]
fn checkpoint_restore_resumes_identically() {
    let dataset = fragile_feature_dataset();
    let config = robust_training_config();
    let mut trainer = AdversarialTrainer::new(
        LinearClassifier::new(2, 2),
        Sgd::new(2.0),
        config.clone(),
    )
    .unwrap();
    let mut recorder = VecRecorder::default();
    trainer.run_epoch(&dataset, &mut recorder).unwrap();
    let snapshot = trainer.checkpoint_state();

    // Serialize through a file the way the persistence layer would.
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("resume.json");
    snapshot.save(&path).unwrap();
    let loaded = adversarial_trainer_rs::checkpoint::TrainCheckpoint::load(&path).unwrap();

    let mut resumed =
        AdversarialTrainer::new(LinearClassifier::new(2, 2), Sgd::new(2.0), config).unwrap();
    resumed.restore_state(&loaded).unwrap();
    assert_eq!(resumed.state(), trainer.state());

    // Both trainers continue to identical parameters.
    trainer.run_epoch(&dataset, &mut recorder).unwrap();
    let mut recorder2 = VecRecorder::default();
    resumed.run_epoch(&dataset, &mut recorder2).unwrap();
    let a = trainer.model().parameters();
    let b = resumed.model().parameters();
    for (pa, pb) in a.iter().zip(b.iter()) {
        for (va, vb) in pa.iter().zip(pb.iter()) {
            assert!((va - vb).abs() < 1e-6);
        }
    }
}

/// Probability-zero mixing never perturbs; probability-one always does.
#[test]
fn mixing_probability_extremes() {
    let constraint = ConstraintSpec::new(NormKind::Linf, 0.1, (-100.0, 100.0)).unwrap();
    for (p, expect_adv) in [(0.0, false), (1.0, true)] {
        let config = TrainerConfig::builder()
            .attack(AttackConfig::fgsm(constraint, 0.1))
            .mix(BatchMix::Probability(p))
            .clean_weight(1.0)
            .robust_weight(1.0)
            .build();
        let mut trainer =
            AdversarialTrainer::new(LinearClassifier::new(2, 2), Sgd::new(0.1), config).unwrap();
        let dataset = fragile_feature_dataset();
        for batch in dataset.epoch_batches(0) {
            let outcome = trainer.step(&batch).unwrap();
            assert_eq!(outcome.adversarial, expect_adv, "p = {p}");
        }
    }
}
