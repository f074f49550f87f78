//! Directed, damped links between audio sources.
//!
//! A command applied to a source is also applied to every source it links
//! to. Volume-bearing effects are attenuated by the edge's damping factor.
//! Every source has an implicit self-edge with damping 1.0, so an unlinked
//! source behaves exactly as if links did not exist.

use crate::command::SourceId;
use std::collections::HashMap;

/// Damping of the implicit self-edge.
pub const SELF_DAMPING: f32 = 1.0;

/// An outgoing edge.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Link {
    /// Driven source.
    pub to: SourceId,
    /// Multiplicative attenuation for volume-bearing effects (not clamped).
    pub damping: f32,
}

/// Adjacency from a source to the sources it drives.
#[derive(Clone, Debug, Default)]
pub struct LinkGraph {
    edges: HashMap<SourceId, Vec<Link>>,
}

impl LinkGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a link from `from` to `to`.
    ///
    /// A bidirectional request creates two independent directed edges.
    /// Adding an edge that already exists replaces its damping. Self-links
    /// are ignored; the implicit self-edge always has damping 1.0.
    pub fn add_link(&mut self, from: SourceId, to: SourceId, damping: f32, bidirectional: bool) {
        if from == to {
            log::warn!("[LINKS] Ignoring explicit self-link on source {}", from);
            return;
        }
        self.insert_edge(from, to, damping);
        if bidirectional {
            self.insert_edge(to, from, damping);
        }
    }

    fn insert_edge(&mut self, from: SourceId, to: SourceId, damping: f32) {
        let links = self.edges.entry(from).or_default();
        match links.iter_mut().find(|link| link.to == to) {
            Some(link) => {
                log::debug!(
                    "[LINKS] Updating {} -> {} damping {:.3} -> {:.3}",
                    from,
                    to,
                    link.damping,
                    damping
                );
                link.damping = damping;
            }
            None => {
                log::debug!("[LINKS] Linking {} -> {} (damping {:.3})", from, to, damping);
                links.push(Link { to, damping });
            }
        }
    }

    /// Remove the edge from `from` to `to` (and the reverse edge if bidirectional).
    ///
    /// Returns the number of edges removed.
    pub fn remove_link(&mut self, from: SourceId, to: SourceId, bidirectional: bool) -> usize {
        let mut removed = self.remove_edge(from, to);
        if bidirectional {
            removed += self.remove_edge(to, from);
        }
        removed
    }

    fn remove_edge(&mut self, from: SourceId, to: SourceId) -> usize {
        let Some(links) = self.edges.get_mut(&from) else {
            return 0;
        };
        let before = links.len();
        links.retain(|link| link.to != to);
        let removed = before - links.len();
        if links.is_empty() {
            self.edges.remove(&from);
        }
        removed
    }

    /// Drop every edge touching `id`, in either direction.
    pub fn remove_source(&mut self, id: SourceId) {
        self.edges.remove(&id);
        self.edges.retain(|_, links| {
            links.retain(|link| link.to != id);
            !links.is_empty()
        });
    }

    /// Outgoing explicit edges of a source, in insertion order.
    pub fn links_from(&self, from: SourceId) -> &[Link] {
        self.edges.get(&from).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Damping of the edge `from -> to`, including the implicit self-edge.
    pub fn damping(&self, from: SourceId, to: SourceId) -> Option<f32> {
        if from == to {
            return Some(SELF_DAMPING);
        }
        self.links_from(from)
            .iter()
            .find(|link| link.to == to)
            .map(|link| link.damping)
    }

    /// Fan-out targets of `source`: the self-edge first, then explicit edges.
    pub fn fan_out(&self, source: SourceId) -> Vec<Link> {
        let explicit = self.links_from(source);
        let mut targets = Vec::with_capacity(explicit.len() + 1);
        targets.push(Link {
            to: source,
            damping: SELF_DAMPING,
        });
        targets.extend_from_slice(explicit);
        targets
    }

    /// Total number of explicit directed edges.
    pub fn edge_count(&self) -> usize {
        self.edges.values().map(Vec::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const A: SourceId = SourceId(1);
    const B: SourceId = SourceId(2);
    const C: SourceId = SourceId(3);

    #[test]
    fn test_unlinked_source_fans_out_to_itself() {
        let graph = LinkGraph::new();
        assert_eq!(
            graph.fan_out(A),
            vec![Link {
                to: A,
                damping: 1.0
            }]
        );
        assert_eq!(graph.damping(A, A), Some(1.0));
        assert_eq!(graph.damping(A, B), None);
    }

    #[test]
    fn test_bidirectional_link_creates_two_edges() {
        let mut graph = LinkGraph::new();
        graph.add_link(A, B, 0.3, true);
        assert_eq!(graph.edge_count(), 2);
        assert_eq!(graph.damping(A, B), Some(0.3));
        assert_eq!(graph.damping(B, A), Some(0.3));

        // Edges are independent once created
        graph.add_link(B, A, 0.6, false);
        assert_eq!(graph.damping(A, B), Some(0.3));
        assert_eq!(graph.damping(B, A), Some(0.6));
        assert_eq!(graph.edge_count(), 2);
    }

    #[test]
    fn test_fan_out_order() {
        let mut graph = LinkGraph::new();
        graph.add_link(A, C, 0.5, false);
        graph.add_link(A, B, 0.25, false);
        let targets: Vec<SourceId> = graph.fan_out(A).iter().map(|l| l.to).collect();
        assert_eq!(targets, vec![A, C, B]);
        // One hop only: C's own edges are not followed
        assert_eq!(graph.fan_out(C).len(), 1);
    }

    #[test]
    fn test_self_link_is_ignored() {
        let mut graph = LinkGraph::new();
        graph.add_link(A, A, 0.1, true);
        assert_eq!(graph.edge_count(), 0);
        assert_eq!(graph.damping(A, A), Some(1.0));
    }

    #[test]
    fn test_remove_link_and_source() {
        let mut graph = LinkGraph::new();
        graph.add_link(A, B, 0.3, true);
        graph.add_link(C, B, 0.5, false);
        assert_eq!(graph.remove_link(A, B, false), 1);
        assert_eq!(graph.damping(B, A), Some(0.3));

        graph.remove_source(B);
        assert_eq!(graph.edge_count(), 0);
        assert!(graph.links_from(C).is_empty());
    }
}
