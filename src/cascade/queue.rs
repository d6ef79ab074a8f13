use crate::models::WorkItem;
use std::collections::VecDeque;

/// Items waiting for one stage, in arrival order.
#[derive(Debug, Default)]
pub struct StageQueue {
    items: VecDeque<WorkItem>,
}

impl StageQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&mut self, item: WorkItem) {
        self.items.push_back(item);
    }

    /// Removes up to `n` items from the head.
    pub fn dequeue_up_to(&mut self, n: usize) -> Vec<WorkItem> {
        let take = n.min(self.items.len());
        self.items.drain(..take).collect()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Payload;
    use serde_json::json;

    fn item(sku: &str) -> WorkItem {
        WorkItem::new(Payload::from(json!({ "sku": sku })))
    }

    #[test]
    fn dequeue_preserves_arrival_order() {
        let mut queue = StageQueue::new();
        let items: Vec<WorkItem> = ["a", "b", "c", "d"].into_iter().map(item).collect();
        for it in &items {
            queue.enqueue(it.clone());
        }
        let first = queue.dequeue_up_to(3);
        assert_eq!(
            first.iter().map(|i| i.id).collect::<Vec<_>>(),
            items[..3].iter().map(|i| i.id).collect::<Vec<_>>()
        );
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.dequeue_up_to(3)[0].id, items[3].id);
    }

    #[test]
    fn dequeue_is_bounded_by_room_and_length() {
        let mut queue = StageQueue::new();
        queue.enqueue(item("a"));
        assert!(queue.dequeue_up_to(0).is_empty());
        assert_eq!(queue.dequeue_up_to(10).len(), 1);
        assert!(queue.is_empty());
        assert!(queue.dequeue_up_to(2).is_empty());
    }

    #[test]
    fn late_arrivals_go_to_the_tail() {
        let mut queue = StageQueue::new();
        let early = item("early");
        let late = item("late");
        queue.enqueue(early.clone());
        queue.enqueue(late.clone());
        let head = queue.dequeue_up_to(1);
        assert_eq!(head[0].id, early.id);
        let resubmitted = item("retry");
        queue.enqueue(resubmitted.clone());
        let rest = queue.dequeue_up_to(5);
        assert_eq!(rest[0].id, late.id);
        assert_eq!(rest[1].id, resubmitted.id);
    }
}
