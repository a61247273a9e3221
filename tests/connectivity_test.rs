//! Tests for connectivity artifacts and exact sparse propagation

use bioplnn::activation::Activation;
use bioplnn::cells::{CellDynamics, SparseLinear, TopographicCell};
use bioplnn::connectivity::{ConnectivitySpec, FeedbackAdjacency, IndexMap};
use bioplnn::BioplnnError;
use burn::backend::NdArray;
use burn::tensor::{Distribution, Tensor, TensorData};

type Backend = NdArray<f32>;

fn dense_tensor(spec: &ConnectivitySpec) -> Tensor<Backend, 2> {
    let device = Default::default();
    let (rows, cols) = spec.shape();
    let values: Vec<f32> = spec.to_dense().iter().copied().collect();
    Tensor::from_data(TensorData::new(values, [rows, cols]), &device)
}

fn max_abs_diff(a: Tensor<Backend, 2>, b: Tensor<Backend, 2>) -> f32 {
    (a - b).abs().max().into_scalar()
}

#[test]
fn test_sparse_matches_dense_matmul() {
    let device = Default::default();
    let spec = ConnectivitySpec::new(
        (5, 4),
        vec![
            (0, 0, 0.5),
            (0, 3, -1.0),
            (1, 1, 2.0),
            (2, 1, 0.25),
            (3, 2, -0.75),
            (4, 0, 1.5),
            (4, 3, 0.1),
        ],
    )
    .unwrap();
    let layer = SparseLinear::<Backend>::new(&spec, &device);
    let x = Tensor::<Backend, 2>::random([3, 5], Distribution::Uniform(-1.0, 1.0), &device);

    let sparse = layer.forward(x.clone());
    let dense = x.matmul(dense_tensor(&spec));

    assert!(max_abs_diff(sparse, dense) < 1e-5);
}

#[test]
fn test_random_topographic_matches_dense() {
    let device = Default::default();
    let spec = ConnectivitySpec::random_topographic((4, 5), 1.0, 6, true, 3).unwrap();
    let layer = SparseLinear::<Backend>::new(&spec, &device);
    let x = Tensor::<Backend, 2>::random([2, 20], Distribution::Uniform(-1.0, 1.0), &device);

    let sparse = layer.forward(x.clone());
    let dense = x.matmul(dense_tensor(&spec));

    assert!(max_abs_diff(sparse, dense) < 1e-4);
}

#[test]
fn test_zero_edge_recurrence_contributes_nothing() {
    let device = Default::default();
    let hh = ConnectivitySpec::empty((6, 6));
    let ih = ConnectivitySpec::identity(6, 1.0);
    let dynamics = CellDynamics::new(Activation::Identity, 1.0).unwrap();
    let cell = TopographicCell::<Backend>::new(&hh, &ih, None, None, dynamics, &device)
        .unwrap()
        .without_bias();

    // whatever the previous state, the next state is the input alone
    let state = Tensor::<Backend, 2>::random([2, 6], Distribution::Uniform(-5.0, 5.0), &device);
    let input = Tensor::<Backend, 2>::random([2, 6], Distribution::Uniform(-1.0, 1.0), &device);

    let next = cell.step(state, input.clone()).unwrap();
    assert_eq!(max_abs_diff(next, input), 0.0);
}

#[test]
fn test_permutation_equivariance() {
    let device = Default::default();
    let n = 9;
    let hh = ConnectivitySpec::random_topographic((3, 3), 1.0, 4, true, 11).unwrap();
    let ih = ConnectivitySpec::random_topographic((3, 3), 0.5, 2, false, 12).unwrap();
    let input_map = IndexMap::new(vec![4, 0, 8], n).unwrap();
    let output_map = IndexMap::new(vec![2, 4, 6, 7], n).unwrap();
    let dynamics = CellDynamics::new(Activation::Tanh, 0.5).unwrap();

    let perm = vec![3, 7, 0, 5, 1, 8, 2, 6, 4];
    let permuted = TopographicCell::<Backend>::new(
        &hh.relabel(&perm, &perm).unwrap(),
        &ih.relabel(&perm, &perm).unwrap(),
        Some(input_map.relabel(&perm).unwrap()),
        Some(output_map.relabel(&perm).unwrap()),
        dynamics,
        &device,
    )
    .unwrap();
    let original = TopographicCell::<Backend>::new(
        &hh,
        &ih,
        Some(input_map),
        Some(output_map),
        dynamics,
        &device,
    )
    .unwrap();

    let input = Tensor::<Backend, 2>::random([2, 3], Distribution::Uniform(-1.0, 1.0), &device);
    let mut state_a = original.init_state(2, &device);
    let mut state_b = permuted.init_state(2, &device);
    for _ in 0..4 {
        state_a = original.step(state_a, input.clone()).unwrap();
        state_b = permuted.step(state_b, input.clone()).unwrap();
    }

    let out_a = original.read_output(state_a).unwrap();
    let out_b = permuted.read_output(state_b).unwrap();
    assert!(max_abs_diff(out_a, out_b) < 1e-5);
}

#[test]
fn test_connectivity_artifact_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("hh.json");
    let spec = ConnectivitySpec::random_topographic((3, 4), 1.0, 3, true, 5).unwrap();

    spec.save(&path).unwrap();
    let loaded = ConnectivitySpec::load(&path).unwrap();

    assert_eq!(loaded, spec);
}

#[test]
fn test_connectivity_artifact_format() {
    let json = r#"{"shape": [2, 3], "edges": [[0, 2, 1.5], [1, 0, -2.0], [0, 2, 0.5]]}"#;
    let spec = ConnectivitySpec::from_json_str(json).unwrap();

    assert_eq!(spec.shape(), (2, 3));
    assert_eq!(spec.nnz(), 2);
    assert_eq!(spec.to_dense()[[0, 2]], 2.0);
}

#[test]
fn test_connectivity_artifact_out_of_range() {
    let json = r#"{"shape": [2, 3], "edges": [[2, 0, 1.0]]}"#;
    assert!(ConnectivitySpec::from_json_str(json).is_err());
}

#[test]
fn test_missing_artifact_is_io_error() {
    let dir = tempfile::tempdir().unwrap();
    let err = ConnectivitySpec::load(dir.path().join("absent.json")).unwrap_err();
    assert!(matches!(err, BioplnnError::Io(_)));
}

#[test]
fn test_index_map_artifact_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("inputs.json");
    let map = IndexMap::new(vec![5, 1, 3], 6).unwrap();

    map.save(&path).unwrap();
    assert_eq!(IndexMap::load(&path, 6).unwrap(), map);

    // the same artifact is out of range for a smaller population
    let err = IndexMap::load(&path, 4).unwrap_err();
    assert!(matches!(err, BioplnnError::IndexOutOfRange { index: 5, .. }));
}

#[test]
fn test_feedback_adjacency_from_json() {
    let adj: FeedbackAdjacency = serde_json::from_str("[[0, 1, 0], [0, 0, 1], [0, 0, 0]]").unwrap();

    assert!(adj.follows_layer_order());
    assert_eq!(adj.edges(), vec![(0, 1), (1, 2)]);
}
