/*!
Orders the steps of a manifest for execution.

Edges come from two places: explicit `depends` lists, and implicit
references to images another step commits or pushes (including referring
to a step by name). The sort is Kahn's algorithm with ready nodes broken
by declaration order, so the result is stable for a given manifest.
Cycle detection happens here, during schedule construction; the runtime
assumes a valid DAG.
*/

use crate::manifest::Manifest;
use anyhow::{bail, ensure, Result};
use std::collections::{BTreeMap, BTreeSet};

/// Produce the execution order for `manifest`, optionally limited to
/// `subset` and the steps those depend on.
pub(crate) fn execution_order(
    manifest: &Manifest,
    subset: Option<&[String]>,
) -> Result<Vec<String>> {
    let names: Vec<&String> = manifest.steps.keys().collect();
    let index_of: BTreeMap<&str, usize> = names
        .iter()
        .enumerate()
        .map(|(i, name)| (name.as_str(), i))
        .collect();

    // Producer lookup: step name itself, plus every repository the step's
    // commit/push sections publish.
    let mut producer_of: BTreeMap<String, usize> = BTreeMap::new();
    for (i, (name, step)) in manifest.steps.iter().enumerate() {
        producer_of.insert(name.clone(), i);
        for repository in step.produced_repositories() {
            producer_of.entry(repository).or_insert(i);
        }
    }

    // edges[from] holds the consumers that must wait for `from`.
    let mut edges: Vec<BTreeSet<usize>> = vec![BTreeSet::new(); names.len()];
    let mut dependencies: Vec<BTreeSet<usize>> = vec![BTreeSet::new(); names.len()];
    fn add_edge(
        from: usize,
        to: usize,
        edges: &mut [BTreeSet<usize>],
        dependencies: &mut [BTreeSet<usize>],
    ) {
        if from != to && edges[from].insert(to) {
            dependencies[to].insert(from);
        }
    }

    for (i, (name, step)) in manifest.steps.iter().enumerate() {
        if let Some(depends) = &step.depends {
            for dep in depends {
                match index_of.get(dep.as_str()) {
                    Some(&from) => add_edge(from, i, &mut edges, &mut dependencies),
                    None => bail!("Step '{}' depends on undefined step '{}'", name, dep),
                }
            }
        }
        for reference in step.referenced_images() {
            if let Some(&from) = lookup_producer(&producer_of, &reference) {
                add_edge(from, i, &mut edges, &mut dependencies);
            }
        }
    }

    // When a subset was requested, keep the selected steps and everything
    // they transitively depend on; the rest is pruned.
    let selected: BTreeSet<usize> = match subset {
        None => (0..names.len()).collect(),
        Some(subset) => {
            let mut pending: Vec<usize> = Vec::new();
            for name in subset {
                match index_of.get(name.as_str()) {
                    Some(&i) => pending.push(i),
                    None => bail!("Unknown step '{}' in step selection", name),
                }
            }
            let mut selected = BTreeSet::new();
            while let Some(i) = pending.pop() {
                if selected.insert(i) {
                    pending.extend(dependencies[i].iter().copied());
                }
            }
            selected
        }
    };

    // Kahn's algorithm; the ready set is ordered by declaration position.
    let mut in_degree: BTreeMap<usize, usize> = selected
        .iter()
        .map(|&i| {
            let degree = dependencies[i].intersection(&selected).count();
            (i, degree)
        })
        .collect();
    let mut ready: BTreeSet<usize> = in_degree
        .iter()
        .filter(|(_, &degree)| degree == 0)
        .map(|(&i, _)| i)
        .collect();

    let mut order = Vec::with_capacity(selected.len());
    while let Some(&next) = ready.iter().next() {
        ready.remove(&next);
        order.push(names[next].clone());
        for &consumer in edges[next].intersection(&selected) {
            if let Some(degree) = in_degree.get_mut(&consumer) {
                *degree -= 1;
                if *degree == 0 {
                    ready.insert(consumer);
                }
            }
        }
    }

    if order.len() != selected.len() {
        let stuck = in_degree
            .iter()
            .find(|(_, &degree)| degree > 0)
            .map(|(&i, _)| names[i].as_str())
            .unwrap_or("unknown");
        bail!(
            "Dependency cycle detected involving step '{}'; steps cannot depend on themselves \
             directly or indirectly",
            stuck
        );
    }

    ensure!(!order.is_empty(), "No steps selected to run");
    Ok(order)
}

/// Match a consumed image reference against the producer table, with and
/// without its tag.
fn lookup_producer<'a>(
    producer_of: &'a BTreeMap<String, usize>,
    reference: &str,
) -> Option<&'a usize> {
    if let Some(found) = producer_of.get(reference) {
        return Some(found);
    }
    if let Some((repository, tag)) = reference.rsplit_once(':') {
        if !tag.contains('/') {
            return producer_of.get(repository);
        }
    }
    None
}

#[cfg(test)]
mod test {
    use super::*;

    fn manifest(yaml: &str) -> Manifest {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn declaration_order_without_edges() {
        let m = manifest(
            r#"
            steps:
              c: { build: . }
              a: { build: . }
              b: { build: . }
        "#,
        );
        let order = execution_order(&m, None).unwrap();
        assert_eq!(order, ["c", "a", "b"]);
    }

    #[test]
    fn depends_edges_are_honored() {
        let m = manifest(
            r#"
            version: 2.0
            steps:
              a: { build: . }
              b:
                depends: [a, c]
                build: .
              c: { build: . }
        "#,
        );
        let order = execution_order(&m, None).unwrap();
        let pos = |s: &str| order.iter().position(|x| x == s).unwrap();
        assert!(pos("a") < pos("b"));
        assert!(pos("c") < pos("b"));
        // Stable tie-break: a and c are both ready first, in declaration
        // order.
        assert_eq!(order, ["a", "c", "b"]);
    }

    #[test]
    fn implicit_edge_from_committed_repository() {
        let m = manifest(
            r#"
            steps:
              test:
                run:
                  image: acme/base:latest
              base:
                build: .
                commit: acme/base
        "#,
        );
        let order = execution_order(&m, None).unwrap();
        assert_eq!(order, ["base", "test"]);
    }

    #[test]
    fn implicit_edge_from_step_name() {
        let m = manifest(
            r#"
            steps:
              base: { build: . }
              test:
                run:
                  image: base
        "#,
        );
        let order = execution_order(&m, None).unwrap();
        assert_eq!(order, ["base", "test"]);
    }

    #[test]
    fn cycle_is_fatal_and_names_a_step() {
        let m = manifest(
            r#"
            version: 2.0
            steps:
              a:
                depends: [b]
                build: .
              b:
                depends: [a]
                build: .
        "#,
        );
        let err = execution_order(&m, None).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("cycle"));
        assert!(message.contains("'a'") || message.contains("'b'"));
    }

    #[test]
    fn subset_keeps_dependencies_and_prunes_the_rest() {
        let m = manifest(
            r#"
            version: 2.0
            steps:
              a: { build: . }
              b:
                depends: [a]
                build: .
              c: { build: . }
              d:
                depends: [c]
                build: .
        "#,
        );
        let order = execution_order(&m, Some(&["b".to_string()])).unwrap();
        assert_eq!(order, ["a", "b"]);
    }

    #[test]
    fn subset_preserves_declared_order() {
        let m = manifest(
            r#"
            steps:
              z: { build: . }
              y: { build: . }
              x: { build: . }
        "#,
        );
        let order =
            execution_order(&m, Some(&["x".to_string(), "z".to_string()])).unwrap();
        assert_eq!(order, ["z", "x"]);
    }

    #[test]
    fn unknown_subset_name_is_fatal() {
        let m = manifest(
            r#"
            steps:
              a: { build: . }
        "#,
        );
        let err = execution_order(&m, Some(&["missing".to_string()])).unwrap_err();
        assert!(err.to_string().contains("missing"));
    }

    #[test]
    fn unknown_depends_target_is_fatal() {
        let m = manifest(
            r#"
            version: 2.0
            steps:
              a:
                depends: [ghost]
                build: .
        "#,
        );
        let err = execution_order(&m, None).unwrap_err();
        assert!(err.to_string().contains("ghost"));
    }
}
