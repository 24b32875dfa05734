use meshstore_storage::{SortMethod, Store};
use meshstore_types::{Condition, Object, Timestamp};
use pretty_assertions::assert_eq;

fn ts(secs: f64) -> Timestamp {
    Timestamp::from_secs(secs)
}

fn put(store: &Store, id: &str, attrs: &[(&str, &[&str])], at: f64) {
    let mut obj = Object::new(id);
    for (key, values) in attrs {
        obj.set_at(key, values.iter().copied(), ts(at));
    }
    store.update(&mut obj).unwrap();
}

fn ids(store: &Store, condition: &Condition) -> Vec<String> {
    store
        .query_ids(condition)
        .unwrap()
        .map(|id| id.unwrap().as_str().to_string())
        .collect()
}

/// Objects a, b, c from the basic scenario plus prefix and multi-value cases.
fn library() -> Store {
    let store = Store::open_in_memory().unwrap();
    put(&store, "a", &[("title", &["X"])], 1.0);
    put(&store, "b", &[("title", &["Y"])], 2.0);
    put(&store, "c", &[("artist", &["Z"])], 3.0);
    put(&store, "d", &[("title", &["Xray"]), ("tags", &["rock", "live"])], 4.0);
    put(&store, "e", &[("title", &["YX"]), ("tags", &["rock"])], 5.0);
    put(&store, "f", &[("title", &["Éclair"]), ("artist", &["Z"])], 6.0);
    store
}

// ── Leaves ───────────────────────────────────────────────────────

#[test]
fn equals_matches_exact_value() {
    let store = library();
    assert_eq!(ids(&store, &Condition::equals("title", "X")), vec!["a"]);
    assert_eq!(ids(&store, &Condition::equals("TITLE", "X")), vec!["a"]);
}

#[test]
fn missing_matches_object_without_key() {
    let store = library();
    assert_eq!(ids(&store, &Condition::missing("title")), vec!["c"]);
}

#[test]
fn prefix_matches_leading_characters_only() {
    let store = library();
    assert_eq!(ids(&store, &Condition::prefix("title", "X")), vec!["a", "d"]);
    assert_eq!(ids(&store, &Condition::prefix("title", "É")), vec!["f"]);
    assert!(ids(&store, &Condition::prefix("title", "Xrayz")).is_empty());
}

#[test]
fn any_matches_live_keys() {
    let store = library();
    assert_eq!(ids(&store, &Condition::any("tags")), vec!["d", "e"]);
}

#[test]
fn timed_before_compares_write_time() {
    let store = library();
    assert_eq!(
        ids(&store, &Condition::timed_before("title", ts(2.5))),
        vec!["a", "b"]
    );
}

#[test]
fn unknown_keys_never_match_except_missing() {
    let store = library();
    assert!(ids(&store, &Condition::equals("nope", "X")).is_empty());
    assert!(ids(&store, &Condition::any("nope")).is_empty());
    assert!(ids(&store, &Condition::prefix("nope", "")).is_empty());
    assert_eq!(ids(&store, &Condition::missing("nope")).len(), 6);
}

#[test]
fn tombstoned_key_counts_as_missing() {
    let store = library();
    put(&store, "a", &[("title", &[])], 10.0);
    assert!(ids(&store, &Condition::equals("title", "X")).is_empty());
    assert_eq!(ids(&store, &Condition::missing("title")), vec!["a", "c"]);
    assert!(!ids(&store, &Condition::any("title")).contains(&"a".to_string()));
}

// ── Combinators ──────────────────────────────────────────────────

#[test]
fn and_across_keys() {
    let store = library();
    let cond = Condition::all_of([Condition::equals("tags", "rock"), Condition::prefix("title", "X")]);
    assert_eq!(ids(&store, &cond), vec!["d"]);
}

#[test]
fn and_on_same_key_requires_both_values() {
    let store = library();
    let both = Condition::all_of([Condition::equals("tags", "rock"), Condition::equals("tags", "live")]);
    assert_eq!(ids(&store, &both), vec!["d"]);

    let impossible = Condition::all_of([Condition::equals("title", "X"), Condition::equals("title", "Y")]);
    assert!(ids(&store, &impossible).is_empty());
}

#[test]
fn or_and_equals_any() {
    let store = library();
    let cond = Condition::one_of([Condition::equals("title", "Y"), Condition::equals("artist", "Z")]);
    assert_eq!(ids(&store, &cond), vec!["b", "c", "f"]);
    assert_eq!(
        ids(&store, &Condition::equals_any("title", ["X", "YX"])),
        vec!["a", "e"]
    );
    assert_eq!(
        ids(&store, &Condition::prefix_any("title", ["Xr", "YX"])),
        vec!["d", "e"]
    );
}

#[test]
fn empty_combinators() {
    let store = library();
    assert_eq!(ids(&store, &Condition::And(Vec::new())).len(), 6);
    assert!(ids(&store, &Condition::Or(Vec::new())).is_empty());
}

#[test]
fn nested_conditions_agree_with_in_memory_matching() {
    let store = library();
    let conditions = [
        Condition::all_of([
            Condition::one_of([Condition::equals("tags", "rock"), Condition::missing("title")]),
            Condition::missing("artist"),
        ]),
        Condition::all_of([
            Condition::prefix("title", "Y"),
            Condition::one_of([Condition::equals("title", "YX"), Condition::any("tags")]),
        ]),
        Condition::one_of([
            Condition::all_of([Condition::any("tags"), Condition::missing("tags")]),
            Condition::timed_before("artist", ts(4.0)),
        ]),
        Condition::all_of([
            Condition::missing("nope"),
            Condition::one_of([Condition::equals("artist", "Z"), Condition::equals("nope", "Q")]),
        ]),
    ];

    let objects: Vec<Object> = store
        .query(&Condition::And(Vec::new()), None)
        .unwrap()
        .map(Result::unwrap)
        .collect();

    for cond in &conditions {
        let expected: Vec<String> = objects
            .iter()
            .filter(|o| o.matches(cond))
            .map(|o| o.id().as_str().to_string())
            .collect();
        assert_eq!(ids(&store, cond), expected, "condition {cond:?}");
    }
}

// ── Iterators ────────────────────────────────────────────────────

#[test]
fn query_loads_objects_with_field_filter() {
    let store = library();
    let objects: Vec<Object> = store
        .query(&Condition::equals("artist", "Z"), Some(&["artist"][..]))
        .unwrap()
        .map(Result::unwrap)
        .collect();
    assert_eq!(objects.len(), 2);
    assert!(objects.iter().all(|o| !o.contains_key("title")));
    assert!(objects.iter().all(|o| o.contains_key("artist")));
}

#[test]
fn iteration_spans_many_pages() {
    let store = Store::open_in_memory().unwrap();
    for i in 0..900 {
        let kind = if i % 3 == 0 { "fizz" } else { "other" };
        put(&store, &format!("n{i:04}"), &[("kind", &[kind])], 1.0);
    }

    let fizz = ids(&store, &Condition::equals("kind", "fizz"));
    assert_eq!(fizz.len(), 300);
    let mut sorted = fizz.clone();
    sorted.sort();
    sorted.dedup();
    assert_eq!(sorted, fizz);
}

#[test]
fn queries_are_restartable() {
    let store = library();
    let cond = Condition::any("title");
    assert_eq!(ids(&store, &cond), ids(&store, &cond));
}

#[test]
fn iterator_does_not_repeat_objects_written_during_iteration() {
    let store = library();
    let mut seen = Vec::new();
    for id in store.query_ids(&Condition::any("title")).unwrap() {
        let id = id.unwrap();
        put(&store, id.as_str(), &[("seen", &["yes"])], 20.0);
        seen.push(id.as_str().to_string());
    }
    assert_eq!(seen, vec!["a", "b", "d", "e", "f"]);
}

// ── Keyed queries ────────────────────────────────────────────────

fn paths() -> Store {
    let store = Store::open_in_memory().unwrap();
    put(&store, "p1", &[("path", &["music/rock"])], 1.0);
    put(&store, "p2", &[("path", &["music/jazz", "music/rock"])], 2.0);
    put(&store, "p3", &[("path", &["video/x"])], 3.0);
    put(&store, "p4", &[("path", &["music/rock/live", "music/rock/studio"])], 4.0);
    store
}

fn keyed(store: &Store, cond: &Condition, method: SortMethod) -> Vec<(String, String)> {
    store
        .query_keyed(cond, "path", None, method)
        .unwrap()
        .map(|entry| {
            let (value, obj) = entry.unwrap();
            (value, obj.id().as_str().to_string())
        })
        .collect()
}

fn pairs(expected: &[(&str, &str)]) -> Vec<(String, String)> {
    expected
        .iter()
        .map(|(v, id)| (v.to_string(), id.to_string()))
        .collect()
}

#[test]
fn keyed_by_value_ascending_and_descending() {
    let store = paths();
    let cond = Condition::prefix("path", "music/");
    assert_eq!(
        keyed(&store, &cond, SortMethod::ValueAsc),
        pairs(&[
            ("music/jazz", "p2"),
            ("music/rock", "p1"),
            ("music/rock", "p2"),
            ("music/rock/live", "p4"),
            ("music/rock/studio", "p4"),
        ])
    );
    assert_eq!(
        keyed(&store, &cond, SortMethod::ValueDesc),
        pairs(&[
            ("music/rock/studio", "p4"),
            ("music/rock/live", "p4"),
            ("music/rock", "p1"),
            ("music/rock", "p2"),
            ("music/jazz", "p2"),
        ])
    );
}

#[test]
fn keyed_by_timestamp() {
    let store = paths();
    let cond = Condition::equals_any("path", ["video/x", "music/jazz"]);
    assert_eq!(
        keyed(&store, &cond, SortMethod::TimestampDesc),
        pairs(&[("video/x", "p3"), ("music/jazz", "p2"), ("music/rock", "p2")])
    );
    assert_eq!(
        keyed(&store, &cond, SortMethod::TimestampAsc),
        pairs(&[("music/jazz", "p2"), ("music/rock", "p2"), ("video/x", "p3")])
    );
}

#[test]
fn keyed_split_groups_children() {
    let store = paths();
    let cond = Condition::prefix("path", "music/");
    let child = SortMethod::split(|v| v.split('/').nth(1).unwrap_or_default().to_string());
    assert_eq!(
        keyed(&store, &cond, child),
        pairs(&[("jazz", "p2"), ("rock", "p1"), ("rock", "p2"), ("rock", "p4")])
    );
    assert_eq!(
        keyed(&store, &Condition::equals("path", "video/x"), SortMethod::after_first('/')),
        pairs(&[("x", "p3")])
    );
}

#[test]
fn keyed_on_unknown_sort_key_is_empty() {
    let store = paths();
    let mut iter = store
        .query_keyed(&Condition::any("path"), "nope", None, SortMethod::default())
        .unwrap();
    assert!(iter.next().is_none());
}
