//! Route solver: weighted digraph over the topology snapshot, shortest
//! paths, and the hysteresis gate that keeps routes from flapping.
//!
//! Edge cost is `rtt_ms + loss_rate * penalty_factor`; a link with no
//! observed RTT costs infinity and is left out of the graph entirely. Paths
//! come from Dijkstra-equivalent search on non-negative weights, so every
//! published path is loop-free by construction.

use crate::store::{AgentRecord, TopologyStore};
use parking_lot::Mutex;
use petgraph::algo::astar;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use relay_models::RouteDirective;
use std::collections::HashMap;
use std::sync::Arc;

pub struct RouteSolver {
    penalty_factor: f64,
    hysteresis: f64,
    /// (source, target) → cost at last publication. Only the hysteresis gate
    /// reads or writes this.
    previous_costs: Mutex<HashMap<(String, String), f64>>,
}

impl RouteSolver {
    pub fn new(penalty_factor: f64, hysteresis: f64) -> Self {
        Self {
            penalty_factor,
            hysteresis,
            previous_costs: Mutex::new(HashMap::new()),
        }
    }

    /// Cost of one directed link. Absent RTT means the link is down.
    pub fn edge_cost(&self, rtt_ms: Option<f64>, loss_rate: f64) -> f64 {
        match rtt_ms {
            None => f64::INFINITY,
            Some(rtt) => rtt + loss_rate * self.penalty_factor,
        }
    }

    fn build_graph(
        &self,
        snapshot: &HashMap<String, Arc<AgentRecord>>,
    ) -> (DiGraph<String, f64>, HashMap<String, NodeIndex>) {
        let mut graph = DiGraph::new();
        let mut index = HashMap::new();

        // Sorted insertion keeps one compute pass deterministic.
        let mut ids: Vec<&String> = snapshot.keys().collect();
        ids.sort();
        for id in &ids {
            let idx = graph.add_node((*id).clone());
            index.insert((*id).clone(), idx);
        }

        for id in &ids {
            let src_idx = index[id.as_str()];
            let record = &snapshot[id.as_str()];
            let mut targets: Vec<&String> = record.metrics.keys().collect();
            targets.sort();
            for target in targets {
                let Some(&dst_idx) = index.get(target.as_str()) else {
                    // Probe target that has not reported itself; not a node.
                    continue;
                };
                let metrics = &record.metrics[target.as_str()];
                let cost = self.edge_cost(metrics.rtt_ms, metrics.loss_rate);
                if cost.is_finite() {
                    graph.add_edge(src_idx, dst_idx, cost);
                }
            }
        }

        (graph, index)
    }

    /// Compute directives for `source` against the store's current snapshot.
    pub async fn compute_routes(
        &self,
        store: &TopologyStore,
        source: &str,
    ) -> Vec<RouteDirective> {
        let snapshot = store.get_all().await;
        self.compute_from_snapshot(&snapshot, source)
    }

    /// Directives for every target whose best path passes the hysteresis
    /// gate. Targets that fail the gate are omitted entirely: an omitted
    /// directive means "no change requested".
    pub fn compute_from_snapshot(
        &self,
        snapshot: &HashMap<String, Arc<AgentRecord>>,
        source: &str,
    ) -> Vec<RouteDirective> {
        let (graph, index) = self.build_graph(snapshot);
        let Some(&src_idx) = index.get(source) else {
            return Vec::new();
        };

        let mut targets: Vec<&String> = index.keys().filter(|id| id.as_str() != source).collect();
        targets.sort();

        let mut routes = Vec::new();
        let mut previous = self.previous_costs.lock();
        for target in targets {
            let dst_idx = index[target.as_str()];
            let Some((cost, path)) =
                astar(&graph, src_idx, |n| n == dst_idx, |e| *e.weight(), |_| 0.0)
            else {
                continue; // unreachable
            };
            if path.len() < 2 {
                continue;
            }

            let key = (source.to_string(), target.clone());
            let publish = match previous.get(&key) {
                None => true,
                Some(&old) => cost < old * (1.0 - self.hysteresis),
            };
            if !publish {
                continue;
            }
            previous.insert(key, cost);

            if path.len() == 2 {
                routes.push(RouteDirective::direct(target));
            } else {
                routes.push(RouteDirective::relay(target, graph[path[1]].clone()));
            }
        }
        routes
    }

    /// Best path from `source` to `target`, with its total cost.
    pub fn shortest_path(
        &self,
        snapshot: &HashMap<String, Arc<AgentRecord>>,
        source: &str,
        target: &str,
    ) -> Option<(f64, Vec<String>)> {
        let (graph, index) = self.build_graph(snapshot);
        let (&src_idx, &dst_idx) = (index.get(source)?, index.get(target)?);
        let (cost, path) = astar(&graph, src_idx, |n| n == dst_idx, |e| *e.weight(), |_| 0.0)?;
        Some((cost, path.into_iter().map(|idx| graph[idx].clone()).collect()))
    }
}

/// True if any node appears twice on the path.
pub fn has_loop(path: &[String]) -> bool {
    let mut seen = std::collections::HashSet::new();
    path.iter().any(|node| !seen.insert(node.as_str()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::LinkMetrics;
    use chrono::Utc;

    fn record(targets: &[(&str, Option<f64>, f64)]) -> Arc<AgentRecord> {
        Arc::new(AgentRecord {
            received_at: Utc::now(),
            metrics: targets
                .iter()
                .map(|(ip, rtt, loss)| {
                    (
                        (*ip).to_string(),
                        LinkMetrics {
                            rtt_ms: *rtt,
                            loss_rate: *loss,
                        },
                    )
                })
                .collect(),
        })
    }

    type Snapshot = HashMap<String, Arc<AgentRecord>>;

    /// A↔B fast, B↔C fast, A↔C slow: relaying A→C through B wins.
    fn relay_topology() -> Snapshot {
        HashMap::from([
            (
                "A".to_string(),
                record(&[("B", Some(10.0), 0.0), ("C", Some(100.0), 0.0)]),
            ),
            (
                "B".to_string(),
                record(&[("A", Some(10.0), 0.0), ("C", Some(10.0), 0.0)]),
            ),
            (
                "C".to_string(),
                record(&[("A", Some(100.0), 0.0), ("B", Some(10.0), 0.0)]),
            ),
        ])
    }

    #[test]
    fn cost_function() {
        let solver = RouteSolver::new(100.0, 0.15);
        assert_eq!(solver.edge_cost(Some(50.0), 0.0), 50.0);
        assert_eq!(solver.edge_cost(Some(50.0), 0.1), 60.0);
        assert!(solver.edge_cost(None, 1.0).is_infinite());
        assert!(solver.edge_cost(None, 0.0).is_infinite());
    }

    #[test]
    fn relay_beats_slow_direct_path() {
        let solver = RouteSolver::new(100.0, 0.15);
        let routes = solver.compute_from_snapshot(&relay_topology(), "A");

        let to_c = routes
            .iter()
            .find(|r| r.dst_cidr == "C/32")
            .expect("route to C");
        assert_eq!(to_c.next_hop, "B");
        assert_eq!(to_c.reason, relay_models::RouteReason::OptimizedPath);

        let to_b = routes
            .iter()
            .find(|r| r.dst_cidr == "B/32")
            .expect("route to B");
        assert!(to_b.is_direct());
        assert_eq!(to_b.reason, relay_models::RouteReason::Default);
    }

    #[test]
    fn shortest_path_reconstructs_the_relay_chain() {
        let solver = RouteSolver::new(100.0, 0.15);
        let (cost, path) = solver
            .shortest_path(&relay_topology(), "A", "C")
            .expect("path to C");
        assert_eq!(cost, 20.0);
        assert_eq!(path, vec!["A", "B", "C"]);
        assert!(!has_loop(&path));
    }

    #[test]
    fn hysteresis_blocks_small_improvements() {
        let solver = RouteSolver::new(100.0, 0.15);
        let two_nodes = |rtt: f64| -> Snapshot {
            HashMap::from([
                ("A".to_string(), record(&[("B", Some(rtt), 0.0)])),
                ("B".to_string(), record(&[("A", Some(rtt), 0.0)])),
            ])
        };

        // First computation always publishes.
        let routes = solver.compute_from_snapshot(&two_nodes(100.0), "A");
        assert_eq!(routes.len(), 1);

        // 10% better: below the 15% bar, omitted.
        let routes = solver.compute_from_snapshot(&two_nodes(90.0), "A");
        assert!(routes.is_empty());

        // 20% better: published, and the stored cost moves.
        let routes = solver.compute_from_snapshot(&two_nodes(80.0), "A");
        assert_eq!(routes.len(), 1);

        // 80 is the new baseline; 75 is only ~6% better.
        let routes = solver.compute_from_snapshot(&two_nodes(75.0), "A");
        assert!(routes.is_empty());
    }

    #[test]
    fn loss_penalty_shifts_the_best_path() {
        // A→B direct: 50ms at 10% loss = cost 60.
        // A→C: 25ms clean, C→B: 25ms clean = cost 50 via C.
        let solver = RouteSolver::new(100.0, 0.15);
        let snapshot: Snapshot = HashMap::from([
            (
                "A".to_string(),
                record(&[("B", Some(50.0), 0.10), ("C", Some(25.0), 0.0)]),
            ),
            ("C".to_string(), record(&[("B", Some(25.0), 0.0)])),
            ("B".to_string(), record(&[])),
        ]);

        let routes = solver.compute_from_snapshot(&snapshot, "A");
        let to_b = routes
            .iter()
            .find(|r| r.dst_cidr == "B/32")
            .expect("route to B");
        assert_eq!(to_b.next_hop, "C");
    }

    #[test]
    fn empty_topology_yields_no_routes() {
        let solver = RouteSolver::new(100.0, 0.15);
        assert!(solver
            .compute_from_snapshot(&HashMap::new(), "A")
            .is_empty());
    }

    #[test]
    fn unknown_source_yields_no_routes() {
        let solver = RouteSolver::new(100.0, 0.15);
        assert!(solver
            .compute_from_snapshot(&relay_topology(), "Z")
            .is_empty());
    }

    #[test]
    fn disconnected_source_yields_no_routes() {
        let solver = RouteSolver::new(100.0, 0.15);
        let snapshot: Snapshot = HashMap::from([
            ("A".to_string(), record(&[])),
            ("B".to_string(), record(&[("C", Some(5.0), 0.0)])),
            ("C".to_string(), record(&[("B", Some(5.0), 0.0)])),
        ]);
        assert!(solver.compute_from_snapshot(&snapshot, "A").is_empty());
    }

    #[test]
    fn dead_link_is_no_edge() {
        // The only edge to B has no RTT, so B is unreachable.
        let solver = RouteSolver::new(100.0, 0.15);
        let snapshot: Snapshot = HashMap::from([
            ("A".to_string(), record(&[("B", None, 1.0)])),
            ("B".to_string(), record(&[("A", Some(5.0), 0.0)])),
        ]);
        assert!(solver.compute_from_snapshot(&snapshot, "A").is_empty());
    }

    #[test]
    fn unreported_probe_targets_are_not_destinations() {
        let solver = RouteSolver::new(100.0, 0.15);
        let snapshot: Snapshot = HashMap::from([
            (
                "A".to_string(),
                record(&[("B", Some(5.0), 0.0), ("ghost", Some(1.0), 0.0)]),
            ),
            ("B".to_string(), record(&[("A", Some(5.0), 0.0)])),
        ]);

        let routes = solver.compute_from_snapshot(&snapshot, "A");
        assert_eq!(routes.len(), 1);
        assert_eq!(routes[0].dst_cidr, "B/32");
    }

    #[test]
    fn published_paths_are_loop_free() {
        let solver = RouteSolver::new(100.0, 0.15);
        let snapshot = relay_topology();
        for source in snapshot.keys() {
            for target in snapshot.keys() {
                if source == target {
                    continue;
                }
                if let Some((_, path)) = solver.shortest_path(&snapshot, source, target) {
                    assert!(!has_loop(&path), "loop in {source}→{target}: {path:?}");
                }
            }
        }
    }

    #[test]
    fn has_loop_detects_repeats() {
        let path = |names: &[&str]| names.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        assert!(!has_loop(&path(&["A", "B", "C"])));
        assert!(has_loop(&path(&["A", "B", "C", "A"])));
        assert!(!has_loop(&path(&[])));
    }
}
