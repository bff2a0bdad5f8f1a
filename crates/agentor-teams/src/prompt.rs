use crate::types::Task;

const EXECUTION_RULES: &str = "\
## Execution rules
- Work only on the task described above.
- Produce the complete deliverable in your response; do not ask follow-up questions.
- If the task cannot be completed, say so plainly and explain what is missing.
- Keep the answer self-contained so it can be passed to the next task unchanged.";

/// Prompt sent to a provider for a task. Same task in, same prompt out.
pub fn build_task_prompt(task: &Task) -> String {
    let mut prompt = format!("# Task: {}\n", task.subject.trim());
    let description = task.description.trim();
    if !description.is_empty() {
        prompt.push('\n');
        prompt.push_str(description);
        prompt.push('\n');
    }
    prompt.push('\n');
    prompt.push_str(EXECUTION_RULES);
    prompt.push('\n');
    prompt
}
