//! Integration tests for the full Listen-Attend-Spell forward passes.

use candle_core::{DType, Device, IndexOp, Tensor};
use candle_nn::{VarBuilder, VarMap};

use las_core::{AcousticBatch, LabelBatch, LasConfig, LasError, PoolAxis};
use model_las::{LasOutput, ListenAttendSpell, TfrScheduler};

const NUM_LABELS: usize = 6;
const EOS: u32 = 7;

fn small_config() -> LasConfig {
    let mut config = LasConfig {
        num_labels: NUM_LABELS,
        ..Default::default()
    };
    config.listener.in_channels = 2;
    config.listener.freq_bins = 16;
    config.listener.conv_channels = 2;
    config.listener.rnn_hidden_size = 8;
    config.listener.rnn_num_layers = 1;
    config.listener.listen_vec_size = 8;

    config.speller.rnn_hidden_size = 8;
    config.speller.rnn_num_layers = 1;
    config.speller.max_seq_len = 12;
    config.speller.chardist_hidden = 6;
    config.speller.attention.proj_hidden_size = 4;
    config.speller.attention.num_heads = 2;
    config
}

fn build(config: LasConfig) -> (VarMap, ListenAttendSpell) {
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
    let model = ListenAttendSpell::new(config, vb).unwrap();
    (varmap, model)
}

fn acoustic(batch: usize, time: usize, lengths: Vec<usize>) -> AcousticBatch {
    let features = Tensor::randn(0f32, 1f32, (batch, 2, 16, time), &Device::Cpu).unwrap();
    AcousticBatch::new(features, lengths).unwrap()
}

/// Декодер всегда выбирает eos: fc1 выдаёт константу, fc2 видит её только в строке eos.
fn force_eos(varmap: &mut VarMap, config: &LasConfig) {
    let device = Device::Cpu;
    let hidden = config.speller.chardist_hidden;
    let in_dim = config.speller.rnn_hidden_size + config.listener.listen_vec_size;
    let vocab = config.label_vec_size();
    varmap
        .set_one(
            "spell.chardist.fc1.weight",
            Tensor::zeros((hidden, in_dim), DType::F32, &device).unwrap(),
        )
        .unwrap();
    varmap
        .set_one(
            "spell.chardist.fc1.bias",
            Tensor::ones(hidden, DType::F32, &device).unwrap(),
        )
        .unwrap();
    let mut w = vec![0f32; vocab * hidden];
    w[EOS as usize * hidden..(EOS as usize + 1) * hidden].fill(1.0);
    varmap
        .set_one(
            "spell.chardist.fc2.weight",
            Tensor::from_vec(w, (vocab, hidden), &device).unwrap(),
        )
        .unwrap();
}

#[test]
fn test_inference_drops_sos_and_eos_columns() {
    let (_varmap, mut model) = build(small_config());
    model.eval();
    assert!(!model.is_training());
    assert_eq!(model.config().label_vec_size(), NUM_LABELS + 2);
    assert_eq!(model.config().eos(), EOS);

    let batch = acoustic(2, 10, vec![10, 7]);
    let out = match model.forward(&batch, None, 0.0).unwrap() {
        LasOutput::Infer(out) => out,
        LasOutput::Train(_) => panic!("expected inference output"),
    };

    let steps = out.log_probs.dim(1).unwrap();
    assert!(steps >= 1 && steps <= 12);
    assert_eq!(out.log_probs.dims(), &[2, steps, NUM_LABELS]);
    assert_eq!(out.attentions.dims(), &[2, 2, steps, 10]);
    assert_eq!(out.output_lengths.len(), 2);
    assert!(out.output_lengths.iter().all(|&l| l <= 12));

    let values: Vec<f32> = out.log_probs.flatten_all().unwrap().to_vec1().unwrap();
    assert!(values.iter().all(|v| v.is_finite() && *v <= 0.0));
}

#[test]
fn test_inference_subtracts_trailing_eos() {
    let config = small_config();
    let (mut varmap, mut model) = build(config.clone());
    force_eos(&mut varmap, &config);
    model.eval();

    let out = model.forward_infer(&acoustic(2, 8, vec![8, 5])).unwrap();
    assert_eq!(out.log_probs.dims(), &[2, 3, NUM_LABELS]);
    assert_eq!(out.output_lengths, vec![0, 0]);
}

#[test]
fn test_training_drops_samples_with_too_long_labels() {
    let (_varmap, mut model) = build(small_config());
    let batch = acoustic(2, 50, vec![50, 30]);
    let mut labels: Vec<u32> = vec![1, 2, 3, 4, 5];
    labels.extend(std::iter::repeat_n(2u32, 40));
    let labels = LabelBatch::new(labels, vec![5, 40]).unwrap();

    let out = model.forward_train(&batch, &labels, 0.9).unwrap();
    assert_eq!(out.kept, vec![0]);
    assert_eq!(out.target_lengths, vec![8]);
    assert_eq!(out.regions, vec![(49, 7)]);
    assert_eq!(out.output_lengths.len(), 1);

    let width = out.targets.dim(1).unwrap();
    assert!(width >= 8);
    assert_eq!(out.log_probs.dims(), &[1, width, NUM_LABELS + 2]);

    let row: Vec<u32> = out.targets.i(0).unwrap().to_vec1().unwrap();
    assert_eq!(&row[..8], &[1, 2, 3, 4, 5, EOS, EOS, EOS]);
    assert!(row[8..].iter().all(|&id| id == 0));
}

#[test]
fn test_training_pads_short_predictions_with_blank() {
    let config = small_config();
    let (mut varmap, mut model) = build(config.clone());
    force_eos(&mut varmap, &config);

    let batch = acoustic(2, 12, vec![12, 9]);
    let labels = LabelBatch::new(vec![1, 2, 3, 4, 5, 3, 2], vec![5, 2]).unwrap();
    let out = model.forward_train(&batch, &labels, 0.0).unwrap();

    // Декодер останавливается после трёх eos, цели шире: 5 + 3.
    assert_eq!(out.output_lengths, vec![3, 3]);
    assert_eq!(out.target_lengths, vec![8, 5]);
    assert_eq!(out.log_probs.dims(), &[2, 8, NUM_LABELS + 2]);
    assert_eq!(out.targets.dims(), &[2, 8]);

    // Дополненные шаги заполнены сглаженным one-hot blank.
    let padded: Vec<f32> = out.log_probs.i((1, 6)).unwrap().to_vec1().unwrap();
    let floor = config.smoothing;
    let expected_blank = ((1.0 - floor) + floor / 8.0).ln() as f32;
    assert!((padded[0] - expected_blank).abs() < 1e-4);
    assert!(padded[1..].iter().all(|&v| v < -5.0));
}

#[test]
fn test_training_with_no_valid_samples_is_an_error() {
    let (_varmap, mut model) = build(small_config());
    let batch = acoustic(1, 5, vec![5]);
    let labels = LabelBatch::new(vec![1, 2, 3, 4, 5], vec![5]).unwrap();
    let err = model.forward_train(&batch, &labels, 0.5).unwrap_err();
    assert!(matches!(err, LasError::EmptyBatch));
}

#[test]
fn test_training_dispatch_requires_labels() {
    let (_varmap, mut model) = build(small_config());
    assert!(model.is_training());
    let batch = acoustic(1, 6, vec![6]);
    let err = model.forward(&batch, None, 0.5).unwrap_err();
    assert!(matches!(err, LasError::Data(_)));
}

#[test]
fn test_ratio_outside_unit_interval_is_rejected() {
    let (_varmap, mut model) = build(small_config());
    let batch = acoustic(1, 6, vec![6]);
    let labels = LabelBatch::new(vec![1], vec![1]).unwrap();
    let err = model.forward_train(&batch, &labels, 1.5).unwrap_err();
    assert!(matches!(err, LasError::Config(_)));
}

#[test]
fn test_same_seed_and_weights_reproduce_training_pass() {
    let config = small_config();
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
    let mut a = ListenAttendSpell::new(config.clone(), vb.clone()).unwrap();
    let mut b = ListenAttendSpell::new(config, vb).unwrap();

    let batch = acoustic(2, 9, vec![9, 6]);
    let labels = LabelBatch::new(vec![1, 2, 3, 4], vec![3, 1]).unwrap();
    let out_a = a.forward_train(&batch, &labels, 0.5).unwrap();
    let out_b = b.forward_train(&batch, &labels, 0.5).unwrap();

    assert_eq!(out_a.output_lengths, out_b.output_lengths);
    assert_eq!(out_a.log_probs.dims(), out_b.log_probs.dims());
    let diff: f32 = (out_a.log_probs - out_b.log_probs)
        .unwrap()
        .abs()
        .unwrap()
        .sum_all()
        .unwrap()
        .to_scalar()
        .unwrap();
    assert_eq!(diff, 0.0);
}

#[test]
fn test_time_pooling_shortens_attention_span() {
    let mut config = small_config();
    config.listener.pool_axis = PoolAxis::Time;
    let (_varmap, mut model) = build(config);
    model.eval();

    // 20 → 10 → 5 → 3; 9 → 5 → 3 → 2
    let out = model.forward_infer(&acoustic(2, 20, vec![20, 9])).unwrap();
    let steps = out.attentions.dim(2).unwrap();
    assert_eq!(out.attentions.dims(), &[2, 2, steps, 3]);

    // Замаскированный хвост второго сэмпла не получает веса.
    let tail: Vec<f32> = out
        .attentions
        .i((1, .., .., 2))
        .unwrap()
        .flatten_all()
        .unwrap()
        .to_vec1()
        .unwrap();
    assert!(tail.iter().all(|&w| w == 0.0));
}

#[test]
fn test_scheduler_ratio_feeds_training_pass() {
    let config = small_config();
    let mut scheduler = TfrScheduler::new(&config.tfr_scheduler).unwrap();
    let (_varmap, mut model) = build(config);

    let batch = acoustic(1, 8, vec![8]);
    let labels = LabelBatch::new(vec![3, 4], vec![2]).unwrap();
    for _ in 0..3 {
        let ratio = scheduler.step(None);
        let out = model.forward_train(&batch, &labels, ratio).unwrap();
        assert_eq!(out.kept, vec![0]);
    }
    assert_eq!(scheduler.last_epoch(), 2);
}

#[test]
fn test_missing_weights_file_is_io_error() {
    let err = ListenAttendSpell::load_safetensors(
        "/nonexistent/las/model.safetensors",
        small_config(),
        &Device::Cpu,
    )
    .unwrap_err();
    assert!(matches!(err, LasError::Io(_)));
}
