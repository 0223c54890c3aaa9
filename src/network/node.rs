use std::{collections::BTreeSet, net::SocketAddr};

pub type NodeId = u32;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Availability {
    Available,
    Snapshotting,
}

/// A peer holding a token balance. Owned by exactly one `NodeRuntime` and
/// only mutated under that runtime's lock.
#[derive(Clone, Debug)]
pub struct Node {
    pub id: NodeId,
    pub address: SocketAddr,
    neighbors: BTreeSet<NodeId>,
    balance: u64,
    availability: Availability,
}

impl Node {
    pub fn new(
        id: NodeId,
        address: SocketAddr,
        balance: u64,
        neighbors: impl IntoIterator<Item = NodeId>,
    ) -> Self {
        Node {
            id,
            address,
            neighbors: neighbors.into_iter().collect(),
            balance,
            availability: Availability::Available,
        }
    }

    pub fn neighbors(&self) -> &BTreeSet<NodeId> {
        &self.neighbors
    }

    pub fn is_neighbor(&self, id: NodeId) -> bool {
        self.neighbors.contains(&id)
    }

    pub fn balance(&self) -> u64 {
        self.balance
    }

    /// Saturates at `u64::MAX`; callers reject credits that would overflow.
    pub fn credit(&mut self, amount: u64) {
        self.balance = self.balance.saturating_add(amount);
    }

    /// Returns false and leaves the balance untouched if it cannot cover `amount`.
    pub fn debit(&mut self, amount: u64) -> bool {
        match self.balance.checked_sub(amount) {
            Some(rest) => {
                self.balance = rest;
                true
            }
            None => false,
        }
    }

    pub fn availability(&self) -> Availability {
        self.availability
    }

    pub fn set_availability(&mut self, availability: Availability) {
        self.availability = availability;
    }

    pub fn is_available(&self) -> bool {
        self.availability == Availability::Available
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(balance: u64) -> Node {
        Node::new(0, "127.0.0.1:5000".parse().unwrap(), balance, [1, 2])
    }

    #[test]
    fn test_debit_rejects_overdraft() {
        let mut node = node(5);
        assert!(!node.debit(6));
        assert_eq!(node.balance(), 5);
        assert!(node.debit(5));
        assert_eq!(node.balance(), 0);
    }

    #[test]
    fn test_credit_saturates_instead_of_wrapping() {
        let mut node = node(5);
        node.credit(u64::MAX);
        assert_eq!(node.balance(), u64::MAX);
    }

    #[test]
    fn test_neighbors_are_fixed_at_construction() {
        let node = node(0);
        assert!(node.is_neighbor(1));
        assert!(node.is_neighbor(2));
        assert!(!node.is_neighbor(0));
        assert!(node.is_available());
    }
}
