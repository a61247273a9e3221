//! Tests for layer stacks: update order, feedback timing and flushing

use bioplnn::activation::Activation;
use bioplnn::cells::{CellDynamics, EIState, InterneuronConfig, LayerConfig};
use bioplnn::connectivity::FeedbackAdjacency;
use bioplnn::modulation::{ModulationConfig, ModulationOp, ModulationSteps};
use bioplnn::rnn::{FeedbackResolution, FlushPolicy, LayerStack, LayerStackConfig};
use burn::backend::NdArray;
use burn::tensor::{Distribution, Tensor};

type Backend = NdArray<f32>;

fn max_abs_diff(a: Tensor<Backend, 4>, b: Tensor<Backend, 4>) -> f32 {
    (a - b).abs().max().into_scalar()
}

fn layers() -> Vec<LayerConfig> {
    vec![
        LayerConfig::new(
            4,
            vec![
                InterneuronConfig::new(2, 3),
                InterneuronConfig::new(2, 5)
                    .with_feedforward(true)
                    .with_cross_inhibition(true),
            ],
        )
        .with_feedback(3, 3)
        .with_pool_stride(2),
        LayerConfig::new(5, vec![InterneuronConfig::new(3, 3)]).with_feedback(2, 1),
    ]
}

fn config() -> LayerStackConfig {
    LayerStackConfig::new(2, (8, 8), layers())
        .with_dynamics(CellDynamics::new(Activation::Tanh, 0.5).unwrap())
}

fn input() -> Tensor<Backend, 4> {
    let device = Default::default();
    Tensor::random([2, 2, 8, 8], Distribution::Uniform(-1.0, 1.0), &device)
}

#[test]
fn test_no_feedback_equals_feedforward_chain() {
    let device = Default::default();
    let stack: LayerStack<Backend> = config()
        .with_feedback(FeedbackAdjacency::none(2))
        .init(&device)
        .unwrap();
    let x = input();

    let (outputs, _) = stack.forward(&[x.clone()], None, None, 4).unwrap();

    let first = stack.layer(0).unwrap();
    let second = stack.layer(1).unwrap();
    let mut s0: EIState<Backend> = first.init_state(2, &device);
    let mut s1: EIState<Backend> = second.init_state(2, &device);
    for (t, stacked) in outputs.into_iter().enumerate() {
        s0 = first.step(x.clone(), None, s0).unwrap();
        let o0 = first.output(s0.pyr.clone());
        s1 = second.step(o0, None, s1).unwrap();
        let o1 = second.output(s1.pyr.clone());

        assert!(max_abs_diff(stacked, o1) < 1e-6, "step {} differs", t);
    }
}

#[test]
fn test_feedback_is_one_step_stale() {
    let device = Default::default();
    let stack: LayerStack<Backend> = config()
        .with_feedback(FeedbackAdjacency::new(vec![vec![0, 0], vec![1, 0]]).unwrap())
        .init(&device)
        .unwrap();
    let x = input();

    let mut state = stack.init_state(2, &device);
    // t = 0 consumes a zeroed buffer
    let fb0 = state.fb[0].clone().unwrap();
    assert_eq!(fb0.abs().sum().into_scalar(), 0.0);

    for t in 0..3 {
        let previous = state.clone();
        state = stack.step(t, x.clone(), None, state).unwrap();

        // layer 0 consumed feedback built from the outputs of step t - 1
        let expected = stack
            .layer(0)
            .unwrap()
            .step(
                x.clone(),
                previous.fb[0].clone(),
                EIState {
                    pyr: previous.pyr[0].clone(),
                    inter: previous.inter[0].clone(),
                },
            )
            .unwrap();
        assert!(max_abs_diff(state.pyr[0].clone(), expected.pyr) < 1e-6);

        // and the buffer left for step t + 1 is built from this step's outputs
        let rebuilt = stack.feedback_into(0, &state.out).unwrap().unwrap();
        assert!(max_abs_diff(state.fb[0].clone().unwrap(), rebuilt) < 1e-6);
    }
}

#[test]
fn test_same_step_feedback_uses_current_outputs() {
    let device = Default::default();
    let stack: LayerStack<Backend> = config()
        .with_feedback(FeedbackAdjacency::new(vec![vec![0, 1], vec![0, 0]]).unwrap())
        .with_fb_resolution(FeedbackResolution::SameStep)
        .init(&device)
        .unwrap();
    let x = input();

    let state = stack.init_state(2, &device);
    let state = stack.step(0, x, None, state).unwrap();

    let rebuilt = stack.feedback_into(1, &state.out).unwrap().unwrap();
    assert!(max_abs_diff(state.fb[1].clone().unwrap(), rebuilt) < 1e-6);
    assert!(state.fb[0].is_none());
}

#[test]
fn test_flush_hidden_repeats_outputs() {
    let device = Default::default();
    let stack: LayerStack<Backend> = config()
        .with_feedback(FeedbackAdjacency::new(vec![vec![0, 0], vec![1, 0]]).unwrap())
        .init(&device)
        .unwrap();
    let x = input();

    let (first, state) = stack.forward(&[x.clone()], None, None, 3).unwrap();
    let (second, _) = stack.forward(&[x], None, Some(state), 3).unwrap();

    for (a, b) in first.into_iter().zip(second) {
        assert_eq!(max_abs_diff(a, b), 0.0);
    }
}

#[test]
fn test_output_buffer_carry_is_overwritten() {
    let device = Default::default();
    let stack: LayerStack<Backend> = config()
        .with_flush(FlushPolicy {
            hidden: true,
            out: false,
            fb: true,
        })
        .init(&device)
        .unwrap();
    let x = input();

    let (first, state) = stack.forward(&[x.clone()], None, None, 2).unwrap();
    let (second, _) = stack.forward(&[x], None, Some(state), 2).unwrap();

    for (a, b) in first.into_iter().zip(second) {
        assert_eq!(max_abs_diff(a, b), 0.0);
    }
}

#[test]
fn test_streaming_continues_from_carried_state() {
    let device = Default::default();
    let stack: LayerStack<Backend> = config()
        .with_feedback(FeedbackAdjacency::new(vec![vec![0, 0], vec![1, 0]]).unwrap())
        .with_flush(FlushPolicy::streaming())
        .init(&device)
        .unwrap();
    let x = input();

    let (first, state) = stack.forward(&[x.clone()], None, None, 3).unwrap();
    assert!(state.pyr[0].clone().abs().sum().into_scalar() > 0.0);
    let (second, _) = stack.forward(&[x.clone()], None, Some(state), 3).unwrap();
    assert!(max_abs_diff(first[0].clone(), second[0].clone()) > 0.0);

    // streaming 3 + 3 steps is the same as one 6 step call
    let (long, _) = stack.forward(&[x], None, None, 6).unwrap();
    assert!(max_abs_diff(long[5].clone(), second[2].clone()) < 1e-5);
}

#[test]
fn test_sequence_frames() {
    let device = Default::default();
    let stack: LayerStack<Backend> = config().init(&device).unwrap();
    let frames: Vec<Tensor<Backend, 4>> = (0..3).map(|_| input()).collect();

    let (outputs, state) = stack.forward(&frames, None, None, 3).unwrap();
    assert_eq!(outputs.len(), 3);
    assert_eq!(outputs[2].dims(), [2, 5, 4, 4]);
    assert_eq!(state.inter[0].len(), 2);

    assert!(stack.forward(&frames[..2], None, None, 3).is_err());
}

#[test]
fn test_inactive_modulation_ignores_cue() {
    let device = Default::default();
    let stack: LayerStack<Backend> = config()
        .with_modulation(
            ModulationConfig::new(0)
                .with_op(ModulationOp::Multiply)
                .with_steps(ModulationSteps::At(10)),
        )
        .init(&device)
        .unwrap();
    let x = input();
    let cue_a = Tensor::<Backend, 2>::full([2, 1], 0.0, &device);
    let cue_b = Tensor::<Backend, 2>::full([2, 1], 3.0, &device);

    let (a, _) = stack.forward(&[x.clone()], Some(&cue_a), None, 3).unwrap();
    let (b, _) = stack.forward(&[x], Some(&cue_b), None, 3).unwrap();

    for (a, b) in a.into_iter().zip(b) {
        assert_eq!(max_abs_diff(a, b), 0.0);
    }
}

#[test]
fn test_active_modulation_changes_output() {
    let device = Default::default();
    let stack: LayerStack<Backend> = config()
        .with_modulation(ModulationConfig::new(0).with_steps(ModulationSteps::First))
        .init(&device)
        .unwrap();
    let x = input();
    // relu(0) silences the first layer's output at t = 0
    let silence = Tensor::<Backend, 2>::full([2, 1], -1.0, &device);
    let pass = Tensor::<Backend, 2>::full([2, 1], 1.0, &device);

    let (silenced, silenced_state) = stack.forward(&[x.clone()], Some(&silence), None, 1).unwrap();
    let (passed, _) = stack.forward(&[x], Some(&pass), None, 1).unwrap();

    assert_eq!(silenced_state.out[0].clone().abs().sum().into_scalar(), 0.0);
    assert!(max_abs_diff(silenced[0].clone(), passed[0].clone()) > 0.0);
}
