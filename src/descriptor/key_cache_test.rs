use super::KeyCache;

#[test]
fn test_get_moves_entry_to_front() {
    let mut cache = KeyCache::new(3);
    cache.insert("a".to_string(), 1);
    cache.insert("b".to_string(), 2);
    cache.insert("c".to_string(), 3);
    assert_eq!(cache.keys_by_recency(), vec!["c", "b", "a"]);

    assert_eq!(cache.get("a"), Some(1));
    assert_eq!(cache.keys_by_recency(), vec!["a", "c", "b"]);

    assert_eq!(cache.get("missing"), None);
    assert_eq!(cache.keys_by_recency(), vec!["a", "c", "b"]);
}

#[test]
fn test_insert_evicts_least_recently_used() {
    let mut cache = KeyCache::new(3);
    for (i, key) in ["a", "b", "c"].iter().enumerate() {
        cache.insert(key.to_string(), i);
    }

    // Touch "a" so that "b" becomes the eviction candidate.
    cache.get("a");
    cache.insert("d".to_string(), 3);

    assert_eq!(cache.len(), 3);
    assert!(!cache.contains("b"));
    assert_eq!(cache.keys_by_recency(), vec!["d", "a", "c"]);

    cache.insert("e".to_string(), 4);
    assert!(!cache.contains("c"));
    assert_eq!(cache.keys_by_recency(), vec!["e", "d", "a"]);
}

#[test]
fn test_reinsert_updates_value_without_growing() {
    let mut cache = KeyCache::new(2);
    cache.insert("a".to_string(), 1);
    cache.insert("b".to_string(), 2);
    cache.insert("a".to_string(), 10);

    assert_eq!(cache.len(), 2);
    assert_eq!(cache.get("a"), Some(10));
    assert_eq!(cache.keys_by_recency(), vec!["a", "b"]);
}

#[test]
fn test_cache_never_exceeds_capacity() {
    let capacity = 50;
    let mut cache = KeyCache::new(capacity);
    for i in 0..(capacity * 4) {
        cache.insert(format!("key/{i}"), i);
        assert!(cache.len() <= capacity);
    }

    // The last `capacity` keys survive, newest first.
    let expected: Vec<String> = (capacity * 3..capacity * 4).rev().map(|i| format!("key/{i}")).collect();
    assert_eq!(cache.keys_by_recency(), expected);
}

#[test]
fn test_single_slot_and_zero_capacity() {
    let mut cache = KeyCache::new(1);
    cache.insert("a".to_string(), None::<u8>);
    cache.insert("b".to_string(), Some(1));
    assert_eq!(cache.keys_by_recency(), vec!["b"]);
    // Cached negative lookups are returned as hits.
    cache.insert("c".to_string(), None);
    assert_eq!(cache.get("c"), Some(None));

    let mut disabled = KeyCache::new(0);
    disabled.insert("a".to_string(), 1);
    assert_eq!(disabled.len(), 0);
    assert_eq!(disabled.get("a"), None);
}

#[test]
fn test_clear_resets_links() {
    let mut cache = KeyCache::new(2);
    cache.insert("a".to_string(), 1);
    cache.insert("b".to_string(), 2);
    cache.clear();
    assert_eq!(cache.len(), 0);
    assert!(cache.keys_by_recency().is_empty());

    cache.insert("c".to_string(), 3);
    assert_eq!(cache.keys_by_recency(), vec!["c"]);
}
