use ferry_protocol::{Bloom, TopicType};
use proptest::prelude::*;

fn arb_bloom() -> impl Strategy<Value = Bloom> {
    prop::array::uniform32(any::<u8>()).prop_flat_map(|lo| {
        prop::array::uniform32(any::<u8>()).prop_map(move |hi| {
            let mut bytes = [0u8; 64];
            bytes[..32].copy_from_slice(&lo);
            bytes[32..].copy_from_slice(&hi);
            Bloom::from_bytes(bytes)
        })
    })
}

proptest! {
    /// OR is absorbing: the union always covers its left operand.
    #[test]
    fn union_covers_left(f in arb_bloom(), g in arb_bloom()) {
        prop_assert!(f.add(&g).matches(&f));
        prop_assert!(f.add(&g).matches(&g));
    }

    #[test]
    fn union_is_commutative(f in arb_bloom(), g in arb_bloom()) {
        prop_assert_eq!(f.add(&g), g.add(&f));
    }

    #[test]
    fn every_filter_matches_itself(f in arb_bloom()) {
        prop_assert!(f.matches(&f));
        prop_assert!(Bloom::full().matches(&f));
    }

    /// A topic always matches the aggregate it was folded into.
    #[test]
    fn topic_in_aggregate(topics in prop::collection::vec(any::<[u8; 4]>(), 1..20)) {
        let topics: Vec<TopicType> = topics.into_iter().map(TopicType).collect();
        let agg = Bloom::from_topics(topics.iter());
        for t in &topics {
            prop_assert!(agg.matches(&Bloom::from_topic(t)));
        }
    }
}
