//! Pure slot-allocation math shared by the store's atomic weighted poll and
//! the processor's sequential fallback, so both paths agree on fairness.

/// Split `total_slots` between the ORDER and OTHER classes proportional to
/// their weights. Each class is capped at its true backlog and leftover
/// slots are redistributed to whichever class still has backlog, ORDER
/// first. Returns `(order_slots, other_slots)`.
pub fn split_classes(
    total_slots: usize,
    order_backlog: usize,
    other_backlog: usize,
    order_weight: u32,
    other_weight: u32,
) -> (usize, usize) {
    if total_slots == 0 || (order_backlog == 0 && other_backlog == 0) {
        return (0, 0);
    }
    if order_backlog == 0 {
        return (0, total_slots.min(other_backlog));
    }
    if other_backlog == 0 {
        return (total_slots.min(order_backlog), 0);
    }

    let total_weight = (order_weight + other_weight).max(1) as f64;
    let base_order =
        ((total_slots as f64) * (order_weight as f64) / total_weight).ceil() as usize;
    let base_order = base_order.min(total_slots);
    let base_other = total_slots - base_order;

    let mut order_slots = base_order.min(order_backlog);
    let mut other_slots = base_other.min(other_backlog);

    let mut remaining = total_slots - order_slots - other_slots;
    if remaining > 0 {
        let extra = remaining.min(order_backlog - order_slots);
        order_slots += extra;
        remaining -= extra;
    }
    if remaining > 0 {
        other_slots += remaining.min(other_backlog - other_slots);
    }

    (order_slots, other_slots)
}

/// Split one class's slots between its retry and normal lanes. `retry_ratio`
/// sets the preferred retry share; each lane is capped at its backlog and
/// leftovers flow to the other lane. Returns `(retry_slots, normal_slots)`.
pub fn split_lanes(
    class_slots: usize,
    retry_eligible: usize,
    normal_backlog: usize,
    retry_ratio: f64,
) -> (usize, usize) {
    if class_slots == 0 {
        return (0, 0);
    }

    let preferred_retry =
        ((class_slots as f64) * retry_ratio.clamp(0.0, 1.0)).ceil() as usize;
    let mut retry_slots = preferred_retry.min(class_slots).min(retry_eligible);
    let mut normal_slots = (class_slots - retry_slots).min(normal_backlog);

    let mut remaining = class_slots - retry_slots - normal_slots;
    if remaining > 0 {
        let extra = remaining.min(retry_eligible - retry_slots);
        retry_slots += extra;
        remaining -= extra;
    }
    if remaining > 0 {
        normal_slots += remaining.min(normal_backlog - normal_slots);
    }

    (retry_slots, normal_slots)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn weights_split_proportionally_with_deep_backlogs() {
        // 7:3 over 10 slots with backlog on both sides
        let (order, other) = split_classes(10, 100, 100, 7, 3);
        assert_eq!(order, 7);
        assert_eq!(other, 3);
    }

    #[test]
    fn order_share_rounds_up() {
        // ceil(5 * 7/10) = 4
        let (order, other) = split_classes(5, 100, 100, 7, 3);
        assert_eq!(order, 4);
        assert_eq!(other, 1);
    }

    #[test]
    fn empty_class_cedes_all_slots() {
        assert_eq!(split_classes(10, 0, 4, 7, 3), (0, 4));
        assert_eq!(split_classes(10, 6, 0, 7, 3), (6, 0));
        assert_eq!(split_classes(10, 0, 0, 7, 3), (0, 0));
    }

    #[test]
    fn leftover_slots_flow_to_the_deeper_class() {
        // ORDER base share is 7 but only 2 queued; OTHER absorbs the rest
        let (order, other) = split_classes(10, 2, 50, 7, 3);
        assert_eq!(order, 2);
        assert_eq!(other, 8);
    }

    #[test]
    fn lane_split_prefers_retry_up_to_ratio() {
        // 0.7 of 10 slots -> 7 retry, 3 normal
        assert_eq!(split_lanes(10, 20, 20, 0.7), (7, 3));
    }

    #[test]
    fn lane_split_redistributes_when_retry_is_shallow() {
        assert_eq!(split_lanes(10, 2, 20, 0.7), (2, 8));
        assert_eq!(split_lanes(10, 20, 1, 0.7), (9, 1));
        assert_eq!(split_lanes(10, 0, 0, 0.7), (0, 0));
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            /// Allocations never exceed slots or backlog, and slots only go
            /// unused when the backlog is exhausted.
            #[test]
            fn class_split_is_work_conserving(
                total in 0usize..100,
                order_backlog in 0usize..200,
                other_backlog in 0usize..200,
                order_weight in 1u32..20,
                other_weight in 1u32..20,
            ) {
                let (order, other) = split_classes(
                    total, order_backlog, other_backlog, order_weight, other_weight,
                );
                prop_assert!(order <= order_backlog);
                prop_assert!(other <= other_backlog);
                prop_assert!(order + other <= total);
                // Work conserving: leftover slots imply drained backlogs
                if order + other < total {
                    prop_assert!(order == order_backlog && other == other_backlog);
                }
            }

            #[test]
            fn lane_split_is_work_conserving(
                slots in 0usize..100,
                retry in 0usize..200,
                normal in 0usize..200,
                ratio in 0.0f64..=1.0,
            ) {
                let (r, n) = split_lanes(slots, retry, normal, ratio);
                prop_assert!(r <= retry);
                prop_assert!(n <= normal);
                prop_assert!(r + n <= slots);
                if r + n < slots {
                    prop_assert!(r == retry && n == normal);
                }
            }
        }
    }
}
