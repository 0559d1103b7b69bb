//! Prompt assembly for supervisor and worker calls.

use echelon_core::hierarchy::TeamSpec;
use echelon_core::provider::TargetInfo;

/// Tool descriptors for the coordinator's closed team set.
pub fn team_targets(teams: &[TeamSpec]) -> Vec<TargetInfo> {
    teams
        .iter()
        .map(|t| TargetInfo {
            name: t.name.clone(),
            description: if t.description.is_empty() {
                format!("Dispatch a task to the {} team", t.name)
            } else {
                t.description.clone()
            },
        })
        .collect()
}

/// Tool descriptors for a team supervisor's closed worker set.
pub fn worker_targets(team: &TeamSpec) -> Vec<TargetInfo> {
    team.workers
        .iter()
        .map(|w| TargetInfo {
            name: w.name.clone(),
            description: if w.description.is_empty() {
                format!("Dispatch a task to the {} worker", w.name)
            } else {
                w.description.clone()
            },
        })
        .collect()
}

/// The coordinator's opening task message.
pub fn coordinator_task(task: &str, teams: &[TeamSpec]) -> String {
    let mut text = String::new();
    text.push_str("Task: ");
    text.push_str(task);
    text.push_str("\n\nAvailable teams:\n");
    for team in teams {
        text.push_str("- ");
        text.push_str(&team.name);
        if !team.description.is_empty() {
            text.push_str(": ");
            text.push_str(&team.description);
        }
        text.push('\n');
    }
    text.push_str(
        "\nDispatch tasks to teams as needed, then finish with a final answer \
         once you have what you need.",
    );
    text
}

/// A team supervisor's opening task message.
pub fn supervisor_task(task: &str, team: &TeamSpec) -> String {
    let mut text = String::new();
    text.push_str("Task for your team: ");
    text.push_str(task);
    if team.workers.is_empty() {
        text.push_str("\n\nYou have no workers; handle the task yourself and finish.");
    } else {
        text.push_str("\n\nAvailable workers:\n");
        for worker in &team.workers {
            text.push_str("- ");
            text.push_str(&worker.name);
            if !worker.description.is_empty() {
                text.push_str(": ");
                text.push_str(&worker.description);
            }
            text.push('\n');
        }
        text.push_str(
            "\nDispatch subtasks to workers as needed, then finish with a summary \
             of the team's result.",
        );
    }
    text
}

/// Appends earlier team results to a task message. Used when context
/// sharing is enabled so later teams see what already finished.
pub fn with_shared_context(task: &str, results: &[(String, String)]) -> String {
    if results.is_empty() {
        return task.to_string();
    }
    let mut text = String::from(task);
    text.push_str("\n\nResults from teams that already completed:\n");
    for (team, output) in results {
        text.push_str("\n[");
        text.push_str(team);
        text.push_str("]\n");
        text.push_str(output);
        text.push('\n');
    }
    text
}

/// Status block showing the coordinator which teams already ran.
pub fn execution_status(executed: &[(String, bool)]) -> Option<String> {
    if executed.is_empty() {
        return None;
    }
    let mut text = String::from("Teams already executed:\n");
    for (team, ok) in executed {
        text.push_str("- ");
        text.push_str(team);
        text.push_str(if *ok { " (completed)" } else { " (failed)" });
        text.push('\n');
    }
    Some(text)
}

/// Feedback message after a dispatch returns.
pub fn dispatch_result(target: &str, result: &str) -> String {
    format!("Result from {target}:\n{result}")
}

/// Corrective message after the model named a target outside its set.
pub fn unknown_target(name: &str, known: &[TargetInfo]) -> String {
    let names: Vec<&str> = known.iter().map(|t| t.name.as_str()).collect();
    format!(
        "There is no dispatch target named {name}. Valid targets: {}. \
         Choose one of them or finish.",
        names.join(", ")
    )
}

/// The synthesis message asked of the coordinator after parallel teams
/// finish.
pub fn synthesis_task(task: &str, results: &[(String, String)], failed: &[String]) -> String {
    let mut text = format!("Original task: {task}\n\nAll teams have finished.");
    if !results.is_empty() {
        text.push_str("\n\nTeam results:\n");
        for (team, output) in results {
            text.push_str("\n[");
            text.push_str(team);
            text.push_str("]\n");
            text.push_str(output);
            text.push('\n');
        }
    }
    if !failed.is_empty() {
        text.push_str("\nTeams that failed: ");
        text.push_str(&failed.join(", "));
        text.push('\n');
    }
    text.push_str("\nSynthesize a final answer from the results above.");
    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use echelon_core::hierarchy::{ModelParams, WorkerSpec};

    fn team(name: &str, workers: Vec<&str>) -> TeamSpec {
        TeamSpec {
            name: name.into(),
            description: String::new(),
            supervisor_prompt: "supervise".into(),
            prevent_duplicate: true,
            share_context: false,
            params: ModelParams::default(),
            workers: workers
                .into_iter()
                .map(|w| WorkerSpec {
                    name: w.into(),
                    description: String::new(),
                    prompt: "work".into(),
                    params: ModelParams::default(),
                })
                .collect(),
        }
    }

    #[test]
    fn coordinator_task_lists_teams() {
        let teams = vec![team("analysis", vec![]), team("review", vec![])];
        let text = coordinator_task("investigate the outage", &teams);
        assert!(text.contains("investigate the outage"));
        assert!(text.contains("- analysis"));
        assert!(text.contains("- review"));
    }

    #[test]
    fn supervisor_task_lists_workers() {
        let text = supervisor_task("dig in", &team("analysis", vec!["reader", "writer"]));
        assert!(text.contains("- reader"));
        assert!(text.contains("- writer"));
    }

    #[test]
    fn workerless_team_is_told_to_self_handle() {
        let text = supervisor_task("dig in", &team("analysis", vec![]));
        assert!(text.contains("no workers"));
    }

    #[test]
    fn shared_context_appends_results_in_order() {
        let results = vec![
            ("analysis".to_string(), "found the bug".to_string()),
            ("review".to_string(), "confirmed".to_string()),
        ];
        let text = with_shared_context("write it up", &results);
        assert!(text.contains("[analysis]\nfound the bug"));
        assert!(text.contains("[review]\nconfirmed"));
        let a = text.find("[analysis]").unwrap();
        let b = text.find("[review]").unwrap();
        assert!(a < b);
    }

    #[test]
    fn shared_context_noop_when_empty() {
        assert_eq!(with_shared_context("task", &[]), "task");
    }

    #[test]
    fn execution_status_marks_failures() {
        let status = execution_status(&[
            ("analysis".to_string(), true),
            ("review".to_string(), false),
        ])
        .unwrap();
        assert!(status.contains("analysis (completed)"));
        assert!(status.contains("review (failed)"));
        assert!(execution_status(&[]).is_none());
    }

    #[test]
    fn unknown_target_names_valid_set() {
        let targets = team_targets(&[team("analysis", vec![]), team("review", vec![])]);
        let text = unknown_target("marketing", &targets);
        assert!(text.contains("marketing"));
        assert!(text.contains("analysis, review"));
    }

    #[test]
    fn synthesis_includes_failures() {
        let text = synthesis_task(
            "task",
            &[("analysis".to_string(), "ok".to_string())],
            &["review".to_string()],
        );
        assert!(text.contains("[analysis]"));
        assert!(text.contains("Teams that failed: review"));
    }
}
