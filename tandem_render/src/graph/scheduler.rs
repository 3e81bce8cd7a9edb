use crate::error::GraphError;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Mark {
    Unvisited,
    Visiting,
    Done,
}

/// Orders the nodes so that every node comes before all of its children.
///
/// `children[i]` lists the nodes that depend on node `i`. The order is the reversed
/// post-order of a depth-first search starting at the nodes in index order.
pub fn topological_sort(children: &[Vec<usize>]) -> Result<Vec<usize>, GraphError> {
    let mut marks = vec![Mark::Unvisited; children.len()];
    let mut post_order = Vec::with_capacity(children.len());
    let mut stack: Vec<(usize, usize)> = Vec::new();

    for root in 0..children.len() {
        if marks[root] != Mark::Unvisited {
            continue;
        }

        marks[root] = Mark::Visiting;
        stack.push((root, 0));

        while let Some(top) = stack.last_mut() {
            let node = top.0;

            match children[node].get(top.1) {
                Some(&child) => {
                    top.1 += 1;

                    match marks[child] {
                        Mark::Unvisited => {
                            marks[child] = Mark::Visiting;
                            stack.push((child, 0));
                        }
                        // Back edge to a node on the current path.
                        Mark::Visiting => return Err(GraphError::CyclicGraph),
                        Mark::Done => (),
                    }
                }
                None => {
                    marks[node] = Mark::Done;
                    post_order.push(node);
                    stack.pop();
                }
            }
        }
    }

    post_order.reverse();
    Ok(post_order)
}

#[cfg(test)]
mod tests {
    use rand::rngs::StdRng;
    use rand::seq::SliceRandom;
    use rand::{Rng, SeedableRng};

    use crate::error::GraphError;

    use super::topological_sort;

    #[test]
    fn sort_chain() {
        assert_eq!(topological_sort(&[vec![1], vec![]]).unwrap(), [0, 1]);
        assert_eq!(topological_sort(&[vec![], vec![0]]).unwrap(), [1, 0]);
    }

    #[test]
    fn sort_empty() {
        assert!(topological_sort(&[]).unwrap().is_empty());
    }

    #[test]
    fn sort_detects_cycles() {
        assert_eq!(
            topological_sort(&[vec![1], vec![2], vec![0]]),
            Err(GraphError::CyclicGraph)
        );
        assert_eq!(topological_sort(&[vec![0]]), Err(GraphError::CyclicGraph));
    }

    #[test]
    fn sort_respects_every_edge() {
        let mut rng = StdRng::seed_from_u64(0x5eed);

        for _ in 0..200 {
            let len = rng.random_range(1..24);

            // Edges only go from lower to higher ranks, so the graph is acyclic.
            let mut ranks: Vec<usize> = (0..len).collect();
            ranks.shuffle(&mut rng);

            let mut children = vec![Vec::new(); len];
            let mut edges = Vec::new();
            for u in 0..len {
                for v in 0..len {
                    if ranks[u] < ranks[v] && rng.random_bool(0.2) {
                        children[u].push(v);
                        edges.push((u, v));
                    }
                }
            }

            let order = topological_sort(&children).unwrap();
            assert_eq!(order.len(), len);

            let mut position = vec![0; len];
            for (index, node) in order.iter().enumerate() {
                position[*node] = index;
            }

            for (u, v) in edges {
                assert!(position[u] < position[v], "edge {} -> {} violated", u, v);
            }
        }
    }
}
