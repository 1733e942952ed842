//! Ordered execution plan for the tasks of one pipeline.

use std::cmp::Reverse;
use std::collections::{BTreeSet, HashMap};

use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use serde::{Deserialize, Serialize};

use crate::agent::AgentId;
use crate::core::{PipelineId, Task, TaskId, TaskType};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum StepStatus {
    Pending,
    Assigned { agent_id: AgentId },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanStep {
    pub task_id: TaskId,
    pub task_type: TaskType,
    pub priority: i32,
    pub status: StepStatus,
    /// Tasks of this pipeline that must finish first.
    pub depends_on: Vec<TaskId>,
}

/// Steps in execution order: discovery before mapping before
/// error_resolution, priority and age deciding within a stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoordinationPlan {
    pub pipeline_id: PipelineId,
    pub steps: Vec<PlanStep>,
}

impl CoordinationPlan {
    /// Build the plan from every pending or assigned task of a pipeline.
    ///
    /// Tasks are nodes of a dependency graph with an edge from each task to
    /// every task of a later stage. The order is a topological sort that
    /// always picks the most urgent ready task, so priority never overrides
    /// a dependency.
    pub fn build(pipeline_id: PipelineId, tasks: Vec<Task>) -> Self {
        let mut graph: DiGraph<Task, ()> = DiGraph::new();
        let nodes: Vec<NodeIndex> = tasks.into_iter().map(|t| graph.add_node(t)).collect();

        for &from in &nodes {
            for &to in &nodes {
                if graph[from].task_type().dependency_rank() < graph[to].task_type().dependency_rank() {
                    graph.add_edge(from, to, ());
                }
            }
        }

        let urgency = |task: &Task| (Reverse(task.priority()), task.created_at(), task.id());

        let mut indegree: HashMap<NodeIndex, usize> = nodes
            .iter()
            .map(|&n| (n, graph.neighbors_directed(n, Direction::Incoming).count()))
            .collect();
        let mut ready: BTreeSet<(Reverse<i32>, chrono::DateTime<chrono::Utc>, TaskId, NodeIndex)> = nodes
            .iter()
            .filter(|n| indegree[*n] == 0)
            .map(|&n| {
                let (p, c, id) = urgency(&graph[n]);
                (p, c, id, n)
            })
            .collect();

        let mut steps = Vec::with_capacity(nodes.len());
        while let Some(next) = ready.pop_first() {
            let node = next.3;
            let task = &graph[node];
            let mut depends_on: Vec<TaskId> = graph
                .neighbors_directed(node, Direction::Incoming)
                .map(|n| graph[n].id())
                .collect();
            depends_on.sort();
            steps.push(PlanStep {
                task_id: task.id(),
                task_type: task.task_type(),
                priority: task.priority(),
                status: match task.assigned_to() {
                    Some(agent_id) => StepStatus::Assigned {
                        agent_id: agent_id.clone(),
                    },
                    None => StepStatus::Pending,
                },
                depends_on,
            });

            for succ in graph.neighbors_directed(node, Direction::Outgoing) {
                if let Some(deg) = indegree.get_mut(&succ) {
                    *deg -= 1;
                    if *deg == 0 {
                        let (p, c, id) = urgency(&graph[succ]);
                        ready.insert((p, c, id, succ));
                    }
                }
            }
        }

        Self { pipeline_id, steps }
    }

    pub fn task_order(&self) -> Vec<TaskId> {
        self.steps.iter().map(|s| s.task_id).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}
