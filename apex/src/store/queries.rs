//! Pure ordering and filtering helpers over in-memory task collections.
//!
//! Kept free of any store or I/O concerns so the queue-ordering invariant
//! (priority, effort, createdAt) can be tested in isolation.

use crate::domain::{QueueKey, Task, TaskStatus};

/// Sorts tasks in place by `(priority, effort, createdAt)` ascending, the
/// order `getNextQueuedTask`/`getPendingTasks` must honor.
pub fn sort_by_queue_order(tasks: &mut [Task]) {
    tasks.sort_by_key(|t| QueueKey {
        priority: t.priority,
        effort: t.effort,
        created_at: t.created_at,
    });
}

/// A task is admissible for dispatch iff it is `pending` and every entry in
/// `dependsOn` resolves (via `is_completed`) to `completed`.
pub fn is_admissible<F>(task: &Task, is_completed: F) -> bool
where
    F: Fn(&str) -> bool,
{
    task.status == TaskStatus::Pending && task.dependencies_satisfied(is_completed)
}

/// Filters and sorts the set of pending tasks whose dependencies are
/// satisfied, without mutating the input.
pub fn ready_tasks<'a, F>(tasks: &'a [Task], is_completed: F) -> Vec<&'a Task>
where
    F: Fn(&str) -> bool,
{
    let mut ready: Vec<&Task> = tasks.iter().filter(|t| is_admissible(t, &is_completed)).collect();
    ready.sort_by_key(|t| QueueKey {
        priority: t.priority,
        effort: t.effort,
        created_at: t.created_at,
    });
    ready
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Effort, Priority};

    fn task_with(priority: Priority, effort: Effort, created_at: i64, id: &str) -> Task {
        let mut t = Task::new(id.into(), "d".into(), "default".into(), "/p".into(), "b".into());
        t.priority = priority;
        t.effort = effort;
        t.created_at = created_at;
        t
    }

    #[test]
    fn s1_priority_ordering_scenario() {
        use Effort::*;
        use Priority::*;
        let mut tasks = vec![
            task_with(Urgent, Xs, 1, "a"),
            task_with(Urgent, Large, 2, "b"),
            task_with(High, Small, 3, "c"),
            task_with(High, Large, 4, "d"),
            task_with(Low, Xs, 5, "e"),
        ];
        // shuffle input order
        tasks.swap(0, 4);
        tasks.swap(1, 3);
        sort_by_queue_order(&mut tasks);
        let ids: Vec<&str> = tasks.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c", "d", "e"]);
    }

    #[test]
    fn ready_tasks_excludes_unsatisfied_dependencies() {
        let mut blocked = task_with(Priority::Normal, Effort::Medium, 1, "blocked");
        blocked.depends_on.insert("missing".into());
        let free = task_with(Priority::Normal, Effort::Medium, 2, "free");
        let tasks = vec![blocked, free];
        let ready = ready_tasks(&tasks, |_| false);
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].id, "free");
    }

    #[test]
    fn ready_tasks_excludes_non_pending() {
        let mut t = task_with(Priority::Normal, Effort::Medium, 1, "x");
        t.status = TaskStatus::InProgress;
        let ready = ready_tasks(&[t], |_| true);
        assert!(ready.is_empty());
    }
}
