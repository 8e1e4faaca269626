//! End-to-end tests for the schema layer: parsing, dependency ordering,
//! cycle detection, and diffing — the cascade-ordering scenarios.

use entidb::schema::parse_schema;
use entidb::{diff_schemas, DependencyGraph, Error, RefOperator, SchemaSource, Store};

fn source(entities: &[(&str, &[(&str, &str)])]) -> SchemaSource {
    let mut src = SchemaSource::new();
    for (name, fields) in entities {
        src.entity(*name, fields.iter().copied());
    }
    src
}

fn pos(order: &[String], name: &str) -> usize {
    order
        .iter()
        .position(|n| n == name)
        .unwrap_or_else(|| panic!("{name} missing from {order:?}"))
}

// ============================================================================
// 1. Company cascade: Employee < Team < Department < Company
// ============================================================================

#[tokio::test]
async fn test_company_cascade_order() {
    let src = source(&[
        (
            "Company",
            &[("departments", "[->Department]"), ("hq", "->Location")],
        ),
        ("Department", &[("teams", "[->Team]")]),
        ("Team", &[("members", "[->Employee]")]),
        ("Employee", &[("name", "string")]),
        ("Location", &[("city", "string")]),
    ]);
    let store = Store::open_memory(&src).unwrap();
    let order = store.graph().topological_sort("Company", true).unwrap();

    assert!(pos(&order, "Employee") < pos(&order, "Team"));
    assert!(pos(&order, "Team") < pos(&order, "Department"));
    assert!(pos(&order, "Department") < pos(&order, "Company"));
    assert!(pos(&order, "Location") < pos(&order, "Company"));
}

// ============================================================================
// 2. Diamond: Bottom before Left and Right, Top last
// ============================================================================

#[tokio::test]
async fn test_diamond_order() {
    let src = source(&[
        ("Top", &[("left", "->Left"), ("right", "->Right")]),
        ("Left", &[("bottom", "->Bottom")]),
        ("Right", &[("bottom", "->Bottom")]),
        ("Bottom", &[("x", "string")]),
    ]);
    let schema = parse_schema(&src).unwrap();
    let graph = DependencyGraph::build(&schema);
    let order = graph.topological_sort("Top", true).unwrap();

    assert!(pos(&order, "Bottom") < pos(&order, "Left"));
    assert!(pos(&order, "Bottom") < pos(&order, "Right"));
    assert_eq!(order.last().map(String::as_str), Some("Top"));
}

// ============================================================================
// 3. Mutual hard references are a cycle, reported with a path
// ============================================================================

#[tokio::test]
async fn test_cycle_detection() {
    let src = source(&[("A", &[("b", "->B")]), ("B", &[("a", "->A")])]);
    let schema = parse_schema(&src).unwrap();
    let graph = DependencyGraph::build(&schema);

    let err = graph.topological_sort("A", true).unwrap_err();
    match err {
        Error::CircularDependency { path } => {
            assert!(path.contains(&"A".to_string()));
            assert!(path.contains(&"B".to_string()));
        }
        other => panic!("expected CircularDependency, got {other:?}"),
    }

    let cycles = graph.detect_cycles();
    assert_eq!(cycles.len(), 1);
    let cycle = &cycles[0];
    assert!(cycle.contains(&"A".to_string()) && cycle.contains(&"B".to_string()));
}

// ============================================================================
// 4. Dependency classification across all operators
// ============================================================================

#[tokio::test]
async fn test_dependency_classification() {
    let src = source(&[
        (
            "Post",
            &[
                ("author", "->Author"),        // hard
                ("editor", "->Editor?"),       // soft (optional)
                ("topic", "~>Topic"),          // soft (fuzzy)
                ("owner", "<~Person|Company"), // soft (fuzzy backward union)
                ("comments", "<-Comment.post"),// none
                ("title", "string"),           // none
            ],
        ),
        ("Author", &[("name", "string")]),
        ("Editor", &[("name", "string")]),
        ("Topic", &[("name", "string")]),
        ("Person", &[("name", "string")]),
        ("Company", &[("name", "string")]),
        ("Comment", &[("post", "->Post")]),
    ]);
    let schema = parse_schema(&src).unwrap();
    let graph = DependencyGraph::build(&schema);

    let post = graph.node("Post").unwrap();
    assert_eq!(
        post.depends_on.iter().collect::<Vec<_>>(),
        vec!["Author"]
    );
    for soft in ["Editor", "Topic", "Person", "Company"] {
        assert!(post.soft_depends_on.contains(soft), "{soft} should be soft");
    }
    assert!(!post.soft_depends_on.contains("Comment"));

    // Reverse index reflects the hard edge.
    assert!(graph.node("Author").unwrap().depended_on_by.contains("Post"));
    // Comment -> Post is hard in the other direction.
    assert!(graph.node("Comment").unwrap().depends_on.contains("Post"));
}

// ============================================================================
// 5. Parallel groups layer by hard dependencies, insertion-order ties
// ============================================================================

#[tokio::test]
async fn test_parallel_groups_layering() {
    let src = source(&[
        ("App", &[("db", "->Database"), ("cache", "->Cache")]),
        ("Database", &[("disk", "->Volume")]),
        ("Cache", &[("disk", "->Volume")]),
        ("Volume", &[("path", "string")]),
    ]);
    let schema = parse_schema(&src).unwrap();
    let graph = DependencyGraph::build(&schema);
    let layers = graph.parallel_groups("App").unwrap();

    assert_eq!(layers[0], vec!["Volume".to_string()]);
    assert_eq!(layers[1], vec!["Database".to_string(), "Cache".to_string()]);
    assert_eq!(layers[2], vec!["App".to_string()]);
}

// ============================================================================
// 6. Parse errors carry the field path
// ============================================================================

#[tokio::test]
async fn test_parse_error_paths() {
    let src = source(&[("Post", &[("title", "strnig")])]);
    match parse_schema(&src).unwrap_err() {
        Error::InvalidSchema { path, .. } => assert_eq!(path, "Post.title"),
        other => panic!("expected InvalidSchema, got {other:?}"),
    }
}

// ============================================================================
// 7. Diff + rename inference across schema versions
// ============================================================================

#[tokio::test]
async fn test_schema_diff_summary() {
    let v1 = parse_schema(&source(&[
        (
            "Post",
            &[("title", "string"), ("body_text", "markdown"), ("cat", "->Category")],
        ),
        ("Category", &[("name", "string")]),
    ]))
    .unwrap();
    let v2 = parse_schema(&source(&[
        (
            "Post",
            &[("title", "string?"), ("body", "markdown"), ("cat", "~>Category")],
        ),
        ("Tag", &[("name", "string")]),
    ]))
    .unwrap();

    let diff = diff_schemas(&v1, &v2);
    assert_eq!(diff.added_entities, vec!["Tag"]);
    assert_eq!(diff.removed_entities, vec!["Category"]);

    let post = diff
        .modified_entities
        .iter()
        .find(|e| e.name == "Post")
        .unwrap();
    assert!(post.added_fields.contains(&"body".to_string()));
    assert!(post.removed_fields.contains(&"body_text".to_string()));
    assert!(post
        .possible_renames
        .iter()
        .any(|r| r.from == "body_text" && r.to == "body"));

    let title = post.changed_fields.iter().find(|c| c.name == "title").unwrap();
    assert_eq!(title.from, "string");
    assert_eq!(title.to, "string?");

    let cat = post.changed_fields.iter().find(|c| c.name == "cat").unwrap();
    assert!(cat.kinds.iter().any(|k| k.as_str() == "operator"));

    let summary = diff.summary();
    assert!(summary.contains("+ entity Tag"));
    assert!(summary.contains("- entity Category"));
    assert!(summary.contains("? rename body_text -> body"));
}

// ============================================================================
// 8. Edge metadata drives cascade field wiring
// ============================================================================

#[tokio::test]
async fn test_edge_list_metadata() {
    let src = source(&[
        (
            "Company",
            &[("departments", "[->Department]"), ("ceo", "->Person?")],
        ),
        ("Department", &[("name", "string")]),
        ("Person", &[("name", "string")]),
    ]);
    let schema = parse_schema(&src).unwrap();
    let graph = DependencyGraph::build(&schema);

    let dept = graph
        .edges()
        .iter()
        .find(|e| e.to == "Department")
        .unwrap();
    assert_eq!(dept.operator, RefOperator::Forward);
    assert!(dept.is_array);
    assert_eq!(dept.field_name, "departments");

    let ceo = graph.edges().iter().find(|e| e.to == "Person").unwrap();
    assert_eq!(ceo.field_name, "ceo?");
    assert!(!ceo.is_array);
}
