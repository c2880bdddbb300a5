use orchcore::{Result, WorkflowDraft};
use std::path::Path;

/// Read a workflow definition from a JSON file
pub fn load_workflow_file(path: impl AsRef<Path>) -> Result<WorkflowDraft> {
    let file = std::fs::File::open(path.as_ref())?;
    let draft: WorkflowDraft = serde_json::from_reader(std::io::BufReader::new(file))?;
    Ok(draft)
}

/// Write a workflow definition as pretty-printed JSON
pub fn save_workflow_file(path: impl AsRef<Path>, draft: &WorkflowDraft) -> Result<()> {
    let json = serde_json::to_string_pretty(draft)?;
    std::fs::write(path.as_ref(), json)?;
    Ok(())
}
