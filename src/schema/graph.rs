//! Schema dependency graph — topological ordering, cycle detection, and
//! parallel-group layering for cascade generation.

use indexmap::{IndexMap, IndexSet};
use serde::{Deserialize, Serialize};

use super::parser::{FieldType, RefOperator, Schema};
use crate::{Error, Result};

// ============================================================================
// Graph data
// ============================================================================

/// Per-entity dependency sets.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyNode {
    /// Hard dependencies: required `->` references.
    pub depends_on: IndexSet<String>,
    /// Soft dependencies: optional `->`, and all `~>` / `<~` references.
    pub soft_depends_on: IndexSet<String>,
    /// Reverse of `depends_on`.
    pub depended_on_by: IndexSet<String>,
}

/// One reference edge, as declared in the schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyEdge {
    pub from: String,
    pub to: String,
    pub operator: RefOperator,
    /// Field name, suffixed with `?` when the field is optional.
    pub field_name: String,
    pub is_array: bool,
}

/// The dependency DAG (hard edges) plus the soft edge set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DependencyGraph {
    nodes: IndexMap<String, DependencyNode>,
    edges: Vec<DependencyEdge>,
}

impl DependencyGraph {
    // ========================================================================
    // Construction
    // ========================================================================

    /// Build the graph from a parsed schema.
    ///
    /// Classification rules:
    /// 1. Primitives contribute no edges.
    /// 2. Required `->` → hard; optional `->` → soft only.
    /// 3. `~>` and `<~` → soft regardless of optionality.
    /// 4. `<-` → no forward dependency.
    pub fn build(schema: &Schema) -> Self {
        let mut graph = Self::default();
        for name in schema.entities.keys() {
            graph.nodes.entry(name.clone()).or_default();
        }

        for (entity_name, entity) in &schema.entities {
            for field in entity.fields.values() {
                if field.field_type != FieldType::Reference {
                    continue;
                }
                let Some(operator) = field.operator else { continue };
                let targets: Vec<String> = match &field.union_types {
                    Some(types) => types.clone(),
                    None => field.target_type.iter().cloned().collect(),
                };
                let field_name = if field.is_optional {
                    format!("{}?", field.name)
                } else {
                    field.name.clone()
                };

                for target in targets {
                    graph.nodes.entry(target.clone()).or_default();
                    graph.edges.push(DependencyEdge {
                        from: entity_name.clone(),
                        to: target.clone(),
                        operator,
                        field_name: field_name.clone(),
                        is_array: field.is_array,
                    });

                    match operator {
                        RefOperator::Forward if !field.is_optional => {
                            graph.nodes[entity_name].depends_on.insert(target.clone());
                            graph.nodes[&target]
                                .depended_on_by
                                .insert(entity_name.clone());
                        }
                        RefOperator::Forward
                        | RefOperator::FuzzyForward
                        | RefOperator::FuzzyBackward => {
                            graph.nodes[entity_name]
                                .soft_depends_on
                                .insert(target.clone());
                        }
                        RefOperator::Backward => {}
                    }
                }
            }
        }
        graph
    }

    pub fn node(&self, name: &str) -> Option<&DependencyNode> {
        self.nodes.get(name)
    }

    pub fn nodes(&self) -> impl Iterator<Item = (&String, &DependencyNode)> {
        self.nodes.iter()
    }

    pub fn edges(&self) -> &[DependencyEdge] {
        &self.edges
    }

    // ========================================================================
    // Topological sort
    // ========================================================================

    /// Types reachable from `root`, ordered so every hard dependency
    /// precedes its dependent.
    ///
    /// With `ignore_optional` (the default for cascade ordering) only hard
    /// edges are traversed. When soft edges are included, a back-edge on a
    /// soft edge is skipped — soft cycles are accepted and linearized —
    /// while a back-edge on a hard edge still fails.
    pub fn topological_sort(&self, root: &str, ignore_optional: bool) -> Result<Vec<String>> {
        let mut order = Vec::new();
        let mut visited = IndexSet::new();
        let mut path = Vec::new();
        self.visit(root, ignore_optional, &mut visited, &mut path, &mut order)?;
        Ok(order)
    }

    fn visit(
        &self,
        name: &str,
        ignore_optional: bool,
        visited: &mut IndexSet<String>,
        path: &mut Vec<String>,
        order: &mut Vec<String>,
    ) -> Result<()> {
        if visited.contains(name) {
            return Ok(());
        }
        if let Some(pos) = path.iter().position(|p| p == name) {
            let mut cycle: Vec<String> = path[pos..].to_vec();
            cycle.push(name.to_string());
            return Err(Error::CircularDependency { path: cycle });
        }
        let Some(node) = self.nodes.get(name) else {
            // A reference to a type the schema never declares: leaf.
            visited.insert(name.to_string());
            order.push(name.to_string());
            return Ok(());
        };

        path.push(name.to_string());
        for dep in &node.depends_on {
            self.visit(dep, ignore_optional, visited, path, order)?;
        }
        if !ignore_optional {
            for dep in &node.soft_depends_on {
                // Soft back-edges are allowed; skip anything on the path.
                if path.iter().any(|p| p == dep) {
                    continue;
                }
                self.visit(dep, ignore_optional, visited, path, order)?;
            }
        }
        path.pop();

        visited.insert(name.to_string());
        order.push(name.to_string());
        Ok(())
    }

    // ========================================================================
    // Cycle detection
    // ========================================================================

    /// Enumerate all simple cycles over hard edges. Returns `[]` for a DAG.
    /// Each cycle is reported once, rooted at its earliest-declared member,
    /// closed with the root repeated: `[A, B, …, A]`.
    pub fn detect_cycles(&self) -> Vec<Vec<String>> {
        let mut cycles = Vec::new();
        let names: Vec<&String> = self.nodes.keys().collect();
        for (min_index, start) in names.iter().enumerate() {
            let mut path = vec![(*start).clone()];
            self.cycle_dfs(start, start, min_index, &names, &mut path, &mut cycles);
        }
        cycles
    }

    fn cycle_dfs(
        &self,
        start: &str,
        current: &str,
        min_index: usize,
        names: &[&String],
        path: &mut Vec<String>,
        cycles: &mut Vec<Vec<String>>,
    ) {
        let Some(node) = self.nodes.get(current) else { return };
        for dep in &node.depends_on {
            if dep == start {
                let mut cycle = path.clone();
                cycle.push(start.to_string());
                cycles.push(cycle);
                continue;
            }
            // Restrict to nodes at or after the root so each cycle is
            // enumerated exactly once.
            let Some(index) = names.iter().position(|n| *n == dep) else { continue };
            if index <= min_index || path.contains(dep) {
                continue;
            }
            path.push(dep.clone());
            self.cycle_dfs(start, dep, min_index, names, path, cycles);
            path.pop();
        }
    }

    // ========================================================================
    // Parallel groups
    // ========================================================================

    /// Layered ordering of the types reachable from `root` over hard edges:
    /// each layer holds types whose hard dependencies all lie in earlier
    /// layers. Layer 0 is the hard-dependency-free frontier. Within a layer,
    /// ordering follows schema declaration order.
    pub fn parallel_groups(&self, root: &str) -> Result<Vec<Vec<String>>> {
        let reachable = self.reachable_hard(root)?;
        let mut placed: IndexSet<String> = IndexSet::new();
        let mut layers = Vec::new();

        while placed.len() < reachable.len() {
            let mut layer = Vec::new();
            for name in &reachable {
                if placed.contains(name) {
                    continue;
                }
                let deps_ready = self
                    .nodes
                    .get(name)
                    .map(|n| {
                        n.depends_on
                            .iter()
                            .filter(|d| reachable.contains(*d))
                            .all(|d| placed.contains(d))
                    })
                    .unwrap_or(true);
                if deps_ready {
                    layer.push(name.clone());
                }
            }
            if layer.is_empty() {
                return Err(Error::CircularDependency {
                    path: reachable
                        .iter()
                        .filter(|n| !placed.contains(*n))
                        .cloned()
                        .collect(),
                });
            }
            for name in &layer {
                placed.insert(name.clone());
            }
            layers.push(layer);
        }
        Ok(layers)
    }

    /// Types reachable from `root` via hard edges, in schema declaration
    /// order. Validates acyclicity as a side effect.
    fn reachable_hard(&self, root: &str) -> Result<IndexSet<String>> {
        let order = self.topological_sort(root, true)?;
        let set: IndexSet<String> = order.into_iter().collect();
        // Re-rank by declaration order for the layer tie-break.
        let mut ranked: Vec<String> = self
            .nodes
            .keys()
            .filter(|n| set.contains(*n))
            .cloned()
            .collect();
        for name in &set {
            if !ranked.contains(name) {
                ranked.push(name.clone());
            }
        }
        Ok(ranked.into_iter().collect())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{parse_schema, SchemaSource};

    fn graph(entities: &[(&str, &[(&str, &str)])]) -> DependencyGraph {
        let mut source = SchemaSource::new();
        for (name, fields) in entities {
            source.entity(*name, fields.iter().copied());
        }
        DependencyGraph::build(&parse_schema(&source).unwrap())
    }

    fn company_schema() -> DependencyGraph {
        graph(&[
            (
                "Company",
                &[("departments", "[->Department]"), ("hq", "->Location")],
            ),
            ("Department", &[("teams", "[->Team]")]),
            ("Team", &[("members", "[->Employee]")]),
            ("Employee", &[("name", "string")]),
            ("Location", &[("city", "string")]),
        ])
    }

    fn pos(order: &[String], name: &str) -> usize {
        order.iter().position(|n| n == name).unwrap()
    }

    #[test]
    fn test_cascade_order() {
        let order = company_schema().topological_sort("Company", true).unwrap();
        assert!(pos(&order, "Employee") < pos(&order, "Team"));
        assert!(pos(&order, "Team") < pos(&order, "Department"));
        assert!(pos(&order, "Department") < pos(&order, "Company"));
        assert!(pos(&order, "Location") < pos(&order, "Company"));
    }

    #[test]
    fn test_diamond_order() {
        let g = graph(&[
            ("Top", &[("left", "->Left"), ("right", "->Right")]),
            ("Left", &[("bottom", "->Bottom")]),
            ("Right", &[("bottom", "->Bottom")]),
            ("Bottom", &[("x", "string")]),
        ]);
        let order = g.topological_sort("Top", true).unwrap();
        assert!(pos(&order, "Bottom") < pos(&order, "Left"));
        assert!(pos(&order, "Bottom") < pos(&order, "Right"));
        assert_eq!(order.last().map(String::as_str), Some("Top"));
    }

    #[test]
    fn test_cycle_raises_with_path() {
        let g = graph(&[("A", &[("b", "->B")]), ("B", &[("a", "->A")])]);
        let err = g.topological_sort("A", true).unwrap_err();
        match err {
            Error::CircularDependency { path } => {
                assert!(path.contains(&"A".to_string()));
                assert!(path.contains(&"B".to_string()));
                assert_eq!(path.first(), path.last());
            }
            other => panic!("expected CircularDependency, got {other:?}"),
        }
    }

    #[test]
    fn test_detect_cycles_enumerates_each_once() {
        let g = graph(&[("A", &[("b", "->B")]), ("B", &[("a", "->A")])]);
        let cycles = g.detect_cycles();
        assert_eq!(cycles.len(), 1);
        assert_eq!(cycles[0].first(), cycles[0].last());

        let dag = company_schema();
        assert!(dag.detect_cycles().is_empty());
    }

    #[test]
    fn test_optional_ref_is_soft() {
        let g = graph(&[
            ("Post", &[("category", "->Category?")]),
            ("Category", &[("name", "string")]),
        ]);
        let node = g.node("Post").unwrap();
        assert!(node.depends_on.is_empty());
        assert!(node.soft_depends_on.contains("Category"));
    }

    #[test]
    fn test_fuzzy_refs_are_soft() {
        let g = graph(&[
            ("Post", &[("topic", "~>Topic"), ("owner", "<~Person|Company")]),
            ("Topic", &[("name", "string")]),
            ("Person", &[("name", "string")]),
            ("Company", &[("name", "string")]),
        ]);
        let node = g.node("Post").unwrap();
        assert!(node.depends_on.is_empty());
        for soft in ["Topic", "Person", "Company"] {
            assert!(node.soft_depends_on.contains(soft), "{soft} should be soft");
        }
    }

    #[test]
    fn test_backward_ref_contributes_nothing() {
        let g = graph(&[
            ("Author", &[("posts", "<-Post.author")]),
            ("Post", &[("title", "string")]),
        ]);
        let node = g.node("Author").unwrap();
        assert!(node.depends_on.is_empty());
        assert!(node.soft_depends_on.is_empty());
    }

    #[test]
    fn test_soft_cycles_are_linearized() {
        let g = graph(&[
            ("A", &[("b", "~>B")]),
            ("B", &[("a", "~>A")]),
        ]);
        // Soft cycle: accepted when traversing soft edges.
        let order = g.topological_sort("A", false).unwrap();
        assert_eq!(order.len(), 2);
        assert!(g.detect_cycles().is_empty());
    }

    #[test]
    fn test_parallel_groups() {
        let layers = company_schema().parallel_groups("Company").unwrap();
        assert_eq!(layers[0], vec!["Employee".to_string(), "Location".to_string()]);
        assert_eq!(layers[1], vec!["Team".to_string()]);
        assert_eq!(layers[2], vec!["Department".to_string()]);
        assert_eq!(layers[3], vec!["Company".to_string()]);
    }

    #[test]
    fn test_edge_metadata() {
        let g = graph(&[
            ("Post", &[("category", "->Category?"), ("tags", "[->Tag]")]),
            ("Category", &[("name", "string")]),
            ("Tag", &[("name", "string")]),
        ]);
        let optional_edge = g.edges().iter().find(|e| e.to == "Category").unwrap();
        assert_eq!(optional_edge.field_name, "category?");
        let array_edge = g.edges().iter().find(|e| e.to == "Tag").unwrap();
        assert!(array_edge.is_array);
        assert_eq!(array_edge.field_name, "tags");
    }
}
