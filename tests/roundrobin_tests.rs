//! Balancer behavior over longer horizons: fairness, proportionality and
//! the adaptive reweighting cycle.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{Duration, TimeZone, Utc};
use hyper::StatusCode;

use gantry::loadbalance::{LoadBalancer, RoundRobin, RoundRobinOptions};
use gantry::timeutils::ManualClock;
use gantry::{Attempt, Endpoint, GantryError, ProxyRequest};

fn manual_clock() -> Arc<ManualClock> {
    Arc::new(ManualClock::new(
        Utc.with_ymd_and_hms(2014, 11, 1, 0, 0, 0).unwrap(),
    ))
}

fn endpoint(port: u16) -> Arc<Endpoint> {
    Arc::new(Endpoint::from_str(&format!("http://localhost:{}", port)).unwrap())
}

async fn empty_request() -> ProxyRequest {
    use hyper::{header::HeaderMap, Method, Version};
    let body = gantry::netutils::BufferedBody::new(hyper::Body::empty())
        .await
        .unwrap();
    ProxyRequest::new(
        1,
        Method::GET,
        "http://proxy/".parse().unwrap(),
        Version::HTTP_11,
        HeaderMap::new(),
        Some("1.2.3.4:1000".parse().unwrap()),
        body,
    )
}

fn attempt(endpoint: Arc<Endpoint>, failed: bool) -> Attempt {
    Attempt {
        endpoint,
        duration: StdDuration::from_millis(1),
        status: if failed { None } else { Some(StatusCode::OK) },
        error: if failed {
            Some(GantryError::network("connection refused"))
        } else {
            None
        },
    }
}

async fn tally(rr: &RoundRobin, picks: usize) -> HashMap<String, usize> {
    let req = empty_request().await;
    let mut counts = HashMap::new();
    for _ in 0..picks {
        let e = rr.next_endpoint(&req).unwrap();
        *counts.entry(e.id().to_string()).or_insert(0) += 1;
    }
    counts
}

#[tokio::test]
async fn test_fairness_over_many_cycles() {
    let rr = RoundRobin::new(manual_clock());
    for port in [5000, 5001, 5002, 5003] {
        rr.add_endpoint(endpoint(port), 1).unwrap();
    }

    // k * N selections with N equal weights: each endpoint exactly k times
    let counts = tally(&rr, 4 * 25).await;
    for port in [5000, 5001, 5002, 5003] {
        assert_eq!(counts[&format!("http://localhost:{}", port)], 25);
    }
}

#[tokio::test]
async fn test_proportionality_over_one_cycle() {
    let rr = RoundRobin::new(manual_clock());
    rr.add_endpoint(endpoint(5000), 5).unwrap();
    rr.add_endpoint(endpoint(5001), 2).unwrap();
    rr.add_endpoint(endpoint(5002), 1).unwrap();

    // One full cycle selects each endpoint exactly its weight
    let counts = tally(&rr, 8).await;
    assert_eq!(counts[&"http://localhost:5000".to_string()], 5);
    assert_eq!(counts[&"http://localhost:5001".to_string()], 2);
    assert_eq!(counts[&"http://localhost:5002".to_string()], 1);
}

/// Drives both endpoint meters to readiness: A failing 100%, B clean.
async fn feed_meters(rr: &RoundRobin, clock: &Arc<ManualClock>, seconds: usize) {
    let req = empty_request().await;
    for _ in 0..seconds {
        rr.observe_response(&req, &attempt(endpoint(5000), true));
        rr.observe_response(&req, &attempt(endpoint(5001), false));
        clock.advance(Duration::seconds(1));
    }
}

#[tokio::test]
async fn test_adaptive_reweighting_probes_and_commits() {
    let clock = manual_clock();
    let rr = RoundRobin::with_options(RoundRobinOptions::new(clock.clone()));
    rr.add_endpoint(endpoint(5000), 1).unwrap();
    rr.add_endpoint(endpoint(5001), 1).unwrap();

    // 100% failure on A across the full meter window
    feed_meters(&rr, &clock, 10).await;

    // The next selection makes the state machine probe B at 8x weight
    let counts = tally(&rr, 9).await;
    let weights: HashMap<_, _> = rr.endpoint_weights().into_iter().collect();
    assert_eq!(weights[&"http://localhost:5001".to_string()], 8);
    assert_eq!(weights[&"http://localhost:5000".to_string()], 1);

    // While probing, one full cycle sends B eight requests for A's one
    assert_eq!(counts[&"http://localhost:5001".to_string()], 8);
    assert_eq!(counts[&"http://localhost:5000".to_string()], 1);

    // Probing period elapses with B's rate unchanged: the new weights are
    // committed and stay in place
    clock.advance(Duration::seconds(5));
    let req = empty_request().await;
    let _ = rr.next_endpoint(&req).unwrap();
    let weights: HashMap<_, _> = rr.endpoint_weights().into_iter().collect();
    assert!(weights[&"http://localhost:5001".to_string()] >= 8);
    assert_eq!(weights[&"http://localhost:5000".to_string()], 1);
}

#[tokio::test]
async fn test_adaptive_reweighting_rolls_back_on_harm() {
    let clock = manual_clock();
    let rr = RoundRobin::with_options(RoundRobinOptions::new(clock.clone()));
    rr.add_endpoint(endpoint(5000), 1).unwrap();
    rr.add_endpoint(endpoint(5001), 1).unwrap();

    feed_meters(&rr, &clock, 10).await;

    // Trigger the probe: B goes to weight 8
    let req = empty_request().await;
    let _ = rr.next_endpoint(&req).unwrap();
    let weights: HashMap<_, _> = rr.endpoint_weights().into_iter().collect();
    assert_eq!(weights[&"http://localhost:5001".to_string()], 8);

    // Under the boosted weight B starts failing hard
    for _ in 0..4 {
        rr.observe_response(&req, &attempt(endpoint(5001), true));
        clock.advance(Duration::seconds(1));
    }

    // When the probing timer expires the machine sees B got significantly
    // worse and restores the exact weight it had before the probe
    clock.advance(Duration::seconds(1));
    let _ = rr.next_endpoint(&req).unwrap();
    let weights: HashMap<_, _> = rr.endpoint_weights().into_iter().collect();
    assert_eq!(weights[&"http://localhost:5001".to_string()], 1);
}

#[tokio::test]
async fn test_weights_recover_after_failures_stop() {
    let clock = manual_clock();
    let rr = RoundRobin::with_options(RoundRobinOptions::new(clock.clone()));
    rr.add_endpoint(endpoint(5000), 1).unwrap();
    rr.add_endpoint(endpoint(5001), 1).unwrap();

    feed_meters(&rr, &clock, 10).await;
    let req = empty_request().await;
    let _ = rr.next_endpoint(&req).unwrap();
    let weights: HashMap<_, _> = rr.endpoint_weights().into_iter().collect();
    assert_eq!(weights[&"http://localhost:5001".to_string()], 8);

    // All failures age out of the meter windows. The first selection after
    // the probing period commits the experiment; the one after that sees a
    // clean slate and steps the boosted weight back toward the original
    clock.advance(Duration::seconds(15));
    let _ = rr.next_endpoint(&req).unwrap();
    let _ = rr.next_endpoint(&req).unwrap();
    let weights: HashMap<_, _> = rr.endpoint_weights().into_iter().collect();
    assert_eq!(weights[&"http://localhost:5001".to_string()], 1);
}
