//! Optional whole-document refinement.

use crate::config::ModelRole;
use crate::error::ForgeError;
use crate::pipeline::llm::AiClient;
use crate::pipeline::postprocess::clean_markdown;
use crate::prompts::refinement_prompt;
use tracing::{info, warn};

/// Strip code-fence tokens from a refined reply.
pub fn strip_fences(text: &str) -> String {
    text.replace("```markdown", "").replace("```", "").trim().to_string()
}

/// Send the assembled document through one refinement call.
///
/// `Ok(None)` when the goal is empty or the reply was blank; the caller keeps
/// the assembled document then, and also on `Err`.
pub async fn refine_document(
    client: &AiClient,
    goal: &str,
    style_guide: &str,
    document: &str,
) -> Result<Option<String>, ForgeError> {
    if goal.trim().is_empty() {
        return Ok(None);
    }
    let request = client.request(
        ModelRole::Refinement,
        refinement_prompt(goal, style_guide, document),
        None,
    );
    info!("Refining document structure using {}...", request.model);
    let reply = client.call(&request).await?;
    if reply.text.trim().is_empty() {
        warn!("Refinement returned an empty reply; keeping the assembled document");
        return Ok(None);
    }
    let refined = clean_markdown(&strip_fences(&reply.text));
    Ok(Some(refined.trim_end().to_string()))
}
