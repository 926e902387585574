//! Bitset filtering and the brute-force fallback for mostly-filtered
//! searches.

mod common;

use common::{random_points, FixtureBuilder};
use pqflash::{BitsetView, Metric, PQFlashIndex, QueryStats, SearchOptions};

#[test]
fn test_filter_ratio_triggers_brute_force() {
    // 3 admissible ids out of 500: admissible fraction 0.006 < 0.01.
    let points = random_points(500, 4, 101);
    let admitted = [5u32, 123, 250];
    let fixture = FixtureBuilder::new(Metric::L2, points.clone()).build();
    let index = PQFlashIndex::<f32>::open(Metric::L2, 1, &fixture.prefix).unwrap();

    let bitset = BitsetView::from_fn(500, |id| !admitted.contains(&(id as u32)));
    let query = [0.0f32, 0.0, 0.0, 0.0];
    let mut stats = QueryStats::default();
    let opts = SearchOptions {
        bitset: Some(bitset),
        filter_ratio: Some(0.01),
        stats: Some(&mut stats),
        ..Default::default()
    };
    let hits = index.cached_beam_search(&query, 10, 20, 4, opts).unwrap();

    assert!(stats.used_brute_force);
    assert_eq!(hits.len(), 3);

    // Exactly the admissible ids, in exact-distance order.
    let mut expected: Vec<(u32, f32)> = admitted
        .iter()
        .map(|&id| {
            let d: f32 = points[id as usize]
                .iter()
                .zip(&query)
                .map(|(a, b)| (a - b) * (a - b))
                .sum();
            (id, d)
        })
        .collect();
    expected.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap().then(a.0.cmp(&b.0)));
    for (got, want) in hits.iter().zip(&expected) {
        assert_eq!(got.0, want.0);
        assert!((got.1 - want.1).abs() < 1e-4);
    }
}

#[test]
fn test_filter_ratio_not_triggered_when_mostly_admissible() {
    let points = random_points(100, 4, 103);
    let fixture = FixtureBuilder::new(Metric::L2, points).build();
    let index = PQFlashIndex::<f32>::open(Metric::L2, 1, &fixture.prefix).unwrap();

    let bitset = BitsetView::from_fn(100, |id| id == 7);
    let mut stats = QueryStats::default();
    let opts = SearchOptions {
        bitset: Some(bitset),
        filter_ratio: Some(0.01),
        stats: Some(&mut stats),
        ..Default::default()
    };
    let hits = index
        .cached_beam_search(&[0.0; 4], 5, 100, 4, opts)
        .unwrap();
    assert!(!stats.used_brute_force);
    assert!(hits.iter().all(|&(id, _)| id != 7));
}

#[test]
fn test_graph_walk_excludes_filtered_but_navigates_through_them() {
    let points = random_points(60, 4, 107);
    let fixture = FixtureBuilder::new(Metric::L2, points).build();
    let index = PQFlashIndex::<f32>::open(Metric::L2, 1, &fixture.prefix).unwrap();

    // Exclude every even id; no filter_ratio, so the graph walk runs.
    let bitset = BitsetView::from_fn(60, |id| id % 2 == 0);
    let query = [0.1f32, -0.2, 0.3, 0.0];
    let opts = SearchOptions {
        bitset: Some(bitset),
        ..Default::default()
    };
    let hits = index.cached_beam_search(&query, 10, 60, 4, opts).unwrap();

    assert_eq!(hits.len(), 10);
    assert!(hits.iter().all(|&(id, _)| id % 2 == 1));

    // With L covering the whole graph, the result is the exact top-10 of
    // the admissible subset even though navigation crossed excluded nodes.
    let expected: Vec<(u32, f32)> = fixture
        .exact_search(Metric::L2, &query, 60, 1.0)
        .into_iter()
        .filter(|&(id, _)| id % 2 == 1)
        .take(10)
        .collect();
    for (got, want) in hits.iter().zip(&expected) {
        assert_eq!(got.0, want.0);
    }
}

#[test]
fn test_brute_force_ties_break_by_smaller_id() {
    // Duplicate points produce exact ties.
    let mut points = random_points(300, 4, 109);
    points[200] = points[50].clone();
    points[150] = points[50].clone();
    let fixture = FixtureBuilder::new(Metric::L2, points.clone()).build();
    let index = PQFlashIndex::<f32>::open(Metric::L2, 1, &fixture.prefix).unwrap();

    let admitted = [50u32, 150, 200];
    let bitset = BitsetView::from_fn(300, |id| !admitted.contains(&(id as u32)));
    let mut stats = QueryStats::default();
    let opts = SearchOptions {
        bitset: Some(bitset),
        filter_ratio: Some(0.05),
        stats: Some(&mut stats),
        ..Default::default()
    };
    let hits = index
        .cached_beam_search(&points[50].clone(), 3, 5, 2, opts)
        .unwrap();
    assert!(stats.used_brute_force);
    let ids: Vec<u32> = hits.iter().map(|h| h.0).collect();
    assert_eq!(ids, vec![50, 150, 200]);
}

#[test]
fn test_brute_force_inner_product_scale() {
    let points = vec![
        vec![1.0, 0.0],
        vec![0.0, 1.0],
        vec![-1.0, 0.0],
        vec![0.5, 0.5],
    ];
    let fixture = FixtureBuilder::new(Metric::InnerProduct, points)
        .max_base_norm(2.0)
        .build();
    let index = PQFlashIndex::<f32>::open(Metric::InnerProduct, 1, &fixture.prefix).unwrap();

    // Everything admissible but ratio high enough to force the sweep.
    let bitset = BitsetView::from_fn(4, |id| id == 2);
    let mut stats = QueryStats::default();
    let opts = SearchOptions {
        bitset: Some(bitset),
        filter_ratio: Some(0.9),
        stats: Some(&mut stats),
        ..Default::default()
    };
    let hits = index
        .cached_beam_search(&[1.0, 0.0], 3, 3, 1, opts)
        .unwrap();
    assert!(stats.used_brute_force);
    // Emitted distances are true inner products, best first.
    assert_eq!(hits[0].0, 0);
    assert!((hits[0].1 - 1.0).abs() < 1e-5);
    assert!(hits.iter().all(|&(id, _)| id != 2));
}
