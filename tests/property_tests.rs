//! Property-based tests of hashing and querying.

use itq::{
    itq::hasher::{hamming_distance, pack_bits, unpack_bits},
    Descriptor, DistanceMethod, ItqIndex, ItqIndexOptions,
};
use proptest::prelude::*;

prop_compose! {
    fn arb_corpus(dim: usize)(
        vectors in prop::collection::vec(prop::collection::vec(-10.0f32..10.0, dim), 2..40)
    ) -> Vec<Vec<f32>> {
        vectors
    }
}

fn arb_distance_method() -> impl Strategy<Value = DistanceMethod> {
    prop_oneof![
        Just(DistanceMethod::Euclidean),
        Just(DistanceMethod::Cosine),
        Just(DistanceMethod::Hik),
    ]
}

proptest! {
    #[test]
    fn bits_survive_packing(bits in prop::collection::vec(0u8..2, 1..=64)) {
        let code = pack_bits(&bits);
        prop_assert_eq!(unpack_bits(code, bits.len()), bits.clone());
        prop_assert_eq!(code.count_ones() as usize, bits.iter().filter(|&&b| b == 1).count());
    }

    #[test]
    fn hamming_distance_is_symmetric(a: u64, b: u64) {
        prop_assert_eq!(hamming_distance(a, b), hamming_distance(b, a));
        prop_assert_eq!(hamming_distance(a, a), 0);
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn codes_fit_and_results_are_ordered(
        corpus in arb_corpus(4),
        query in prop::collection::vec(-10.0f32..10.0, 4),
        bit_length in 1usize..=16,
        n in 1usize..10,
        distance_method in arb_distance_method(),
    ) {
        let index = ItqIndex::new(ItqIndexOptions {
            bit_length,
            itq_iterations: 5,
            distance_method,
            random_seed: Some(0),
        }).unwrap();
        let size = corpus.len();
        index.build_index(corpus.iter().cloned().map(Descriptor::new)).unwrap();

        for vector in corpus.iter().chain(std::iter::once(&query)) {
            let hashed = index.get_small_code(vector).unwrap();
            prop_assert_eq!(hashed.bits.len(), bit_length);
            prop_assert!(bit_length == 64 || hashed.code < 1u64 << bit_length);
        }

        let results = index.nn(&query, n).unwrap();
        prop_assert!(!results.is_empty());
        prop_assert!(results.len() <= n.min(size));
        for pair in results.windows(2) {
            prop_assert!(pair[0].1 <= pair[1].1);
        }
    }
}
