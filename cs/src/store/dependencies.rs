//! Task dependency edges and the acyclicity guarantee

use std::collections::{HashMap, HashSet};

use tracing::debug;

use crate::domain::TaskStatus;

use super::{Result, Store, StoreError};

impl Store {
    /// Task ids this task depends on
    pub fn get_dependencies(&self, task_id: i64) -> Result<Vec<i64>> {
        let mut stmt = self
            .conn()
            .prepare("SELECT depends_on FROM task_dependencies WHERE task_id = ?1 ORDER BY depends_on")?;
        let deps = stmt
            .query_map([task_id], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<i64>>>()?;
        Ok(deps)
    }

    /// All dependency edges as `(task_id, depends_on)` pairs
    pub fn all_dependencies(&self) -> Result<Vec<(i64, i64)>> {
        let mut stmt = self
            .conn()
            .prepare("SELECT task_id, depends_on FROM task_dependencies")?;
        let edges = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(edges)
    }

    /// Add dependencies for a task. The addition is rejected if the
    /// resulting graph would contain a cycle; on rejection nothing is
    /// written.
    pub fn add_task_dependencies(&mut self, task_id: i64, depends_on: &[i64]) -> Result<()> {
        debug!(task_id, ?depends_on, "add_task_dependencies: called");

        // Every referenced task must exist
        self.get_task(task_id)?;
        for dep in depends_on {
            if *dep == task_id {
                return Err(StoreError::Validation(format!(
                    "Task {task_id} cannot depend on itself"
                )));
            }
            self.get_task(*dep)?;
        }

        // Build the hypothetical graph and reject on cycle
        let mut graph: HashMap<i64, Vec<i64>> = HashMap::new();
        for (from, to) in self.all_dependencies()? {
            graph.entry(from).or_default().push(to);
        }
        let entry = graph.entry(task_id).or_default();
        for dep in depends_on {
            entry.push(*dep);
        }
        if let Some(cycle) = find_cycle(&graph) {
            return Err(StoreError::DependencyCycle(cycle));
        }

        let tx = self.conn_mut().transaction()?;
        for dep in depends_on {
            tx.execute(
                "INSERT OR IGNORE INTO task_dependencies (task_id, depends_on) VALUES (?1, ?2)",
                [task_id, *dep],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    /// True iff every dependency of the task has status `done`
    pub fn are_dependencies_met(&self, task_id: i64) -> Result<bool> {
        for dep in self.get_dependencies(task_id)? {
            let task = self.get_task(dep)?;
            if task.status != TaskStatus::Done {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

/// DFS cycle detection over a dependency graph; returns the offending path
fn find_cycle(graph: &HashMap<i64, Vec<i64>>) -> Option<Vec<i64>> {
    let mut visited = HashSet::new();
    let mut rec_stack = HashSet::new();

    for &node in graph.keys() {
        if !visited.contains(&node) {
            let mut path = Vec::new();
            if cycle_dfs(node, graph, &mut visited, &mut rec_stack, &mut path) {
                return Some(path);
            }
        }
    }
    None
}

fn cycle_dfs(
    node: i64,
    graph: &HashMap<i64, Vec<i64>>,
    visited: &mut HashSet<i64>,
    rec_stack: &mut HashSet<i64>,
    path: &mut Vec<i64>,
) -> bool {
    visited.insert(node);
    rec_stack.insert(node);
    path.push(node);

    if let Some(deps) = graph.get(&node) {
        for &dep in deps {
            if !visited.contains(&dep) {
                if cycle_dfs(dep, graph, visited, rec_stack, path) {
                    return true;
                }
            } else if rec_stack.contains(&dep) {
                path.push(dep);
                return true;
            }
        }
    }

    rec_stack.remove(&node);
    path.pop();
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{TaskPatch, TaskTier};
    use crate::store::testutil::project_store;
    use crate::store::NewTask;

    fn three_tasks(store: &mut Store) -> (i64, i64, i64) {
        let a = store.create_task(NewTask::new("a", TaskTier::L1)).unwrap().id;
        let b = store.create_task(NewTask::new("b", TaskTier::L1)).unwrap().id;
        let c = store.create_task(NewTask::new("c", TaskTier::L1)).unwrap().id;
        (a, b, c)
    }

    #[test]
    fn test_add_and_get() {
        let (mut store, _dir) = project_store();
        let (a, b, _c) = three_tasks(&mut store);
        store.add_task_dependencies(b, &[a]).unwrap();
        assert_eq!(store.get_dependencies(b).unwrap(), vec![a]);
    }

    #[test]
    fn test_self_dependency_rejected() {
        let (mut store, _dir) = project_store();
        let (a, _b, _c) = three_tasks(&mut store);
        assert!(matches!(
            store.add_task_dependencies(a, &[a]),
            Err(StoreError::Validation(_))
        ));
    }

    #[test]
    fn test_cycle_rejected_and_nothing_written() {
        let (mut store, _dir) = project_store();
        let (a, b, c) = three_tasks(&mut store);
        store.add_task_dependencies(b, &[a]).unwrap();
        store.add_task_dependencies(c, &[b]).unwrap();

        // a -> c would close the loop a <- b <- c <- a
        assert!(matches!(
            store.add_task_dependencies(a, &[c]),
            Err(StoreError::DependencyCycle(_))
        ));
        assert!(store.get_dependencies(a).unwrap().is_empty());
    }

    #[test]
    fn test_duplicate_edges_ignored() {
        let (mut store, _dir) = project_store();
        let (a, b, _c) = three_tasks(&mut store);
        store.add_task_dependencies(b, &[a]).unwrap();
        store.add_task_dependencies(b, &[a]).unwrap();
        assert_eq!(store.get_dependencies(b).unwrap(), vec![a]);
    }

    #[test]
    fn test_dependencies_met() {
        let (mut store, _dir) = project_store();
        let (a, b, _c) = three_tasks(&mut store);
        store.add_task_dependencies(b, &[a]).unwrap();

        assert!(!store.are_dependencies_met(b).unwrap());

        store
            .update_task(a, &TaskPatch::status(crate::domain::TaskStatus::Done))
            .unwrap();
        assert!(store.are_dependencies_met(b).unwrap());
    }

    #[test]
    fn test_no_dependencies_is_met() {
        let (mut store, _dir) = project_store();
        let (a, _b, _c) = three_tasks(&mut store);
        assert!(store.are_dependencies_met(a).unwrap());
    }
}
