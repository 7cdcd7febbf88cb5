//! Terminal implementation of the decision channel.
//!
//! Prompts run while the sync spinner is suspended. A prompt that cannot be
//! shown (no terminal, interrupted input) counts as "no decision", which makes
//! the cycle suspend or halt instead of guessing.

use async_trait::async_trait;
use dialoguer::{Editor, Select};
use indicatif::ProgressBar;
use tracing::warn;

use snipsync_core::conflict::Conflict;
use snipsync_core::decision::{ConflictChoice, DecisionChannel, EmptyLocalChoice};
use snipsync_core::models::Artifact;

use crate::style;

const PREVIEW_LINES: usize = 12;

pub struct InteractiveDecisions {
    spinner: ProgressBar,
    /// Answer given on the command line (`--yes-pull`, `--force-overwrite`).
    empty_local: Option<EmptyLocalChoice>,
}

impl InteractiveDecisions {
    pub fn new(spinner: ProgressBar, empty_local: Option<EmptyLocalChoice>) -> Self {
        Self {
            spinner,
            empty_local,
        }
    }
}

#[async_trait]
impl DecisionChannel for InteractiveDecisions {
    async fn on_empty_local(&self, remote_count: usize) -> Option<EmptyLocalChoice> {
        if self.empty_local.is_some() {
            return self.empty_local;
        }
        self.spinner.suspend(|| {
            println!();
            println!(
                "{}",
                style::warn(&format!(
                    "Your local collection is empty but the repository holds {remote_count} artifacts."
                ))
            );
            let options = [
                "Pull the repository collection into local storage",
                "Overwrite the repository with the empty local collection",
                "Cancel",
            ];
            let choice = Select::new()
                .with_prompt("How should this sync continue?")
                .items(&options[..])
                .default(0)
                .interact();
            match choice {
                Ok(0) => Some(EmptyLocalChoice::PullRemote),
                Ok(1) => Some(EmptyLocalChoice::ForceOverwrite),
                Ok(_) => Some(EmptyLocalChoice::Cancel),
                Err(e) => {
                    warn!(error = %e, "could not read empty-collection decision");
                    None
                }
            }
        })
    }

    async fn on_conflict(
        &self,
        conflict: &Conflict,
        placeholder: Option<&Artifact>,
    ) -> Option<ConflictChoice> {
        self.spinner.suspend(|| {
            println!();
            println!(
                "{}",
                style::header(&format!("Conflict: {} ({})", conflict.full_path, conflict.conflict_type))
            );
            print_side("Local", conflict.local.as_ref());
            print_side("Remote", conflict.remote.as_ref());

            let options = ["Keep local", "Keep remote", "Edit merged content", "Decide later"];
            let choice = Select::new()
                .with_prompt("Resolve with")
                .items(&options[..])
                .default(3)
                .interact();
            match choice {
                Ok(0) => Some(ConflictChoice::KeepLocal),
                Ok(1) => Some(ConflictChoice::KeepRemote),
                Ok(2) => edit_content(conflict, placeholder),
                Ok(_) => Some(ConflictChoice::Defer),
                Err(e) => {
                    warn!(error = %e, path = %conflict.full_path, "could not read conflict decision");
                    None
                }
            }
        })
    }
}

fn print_side(label: &str, artifact: Option<&Artifact>) {
    println!();
    match artifact.and_then(Artifact::body) {
        Some(body) => {
            let lines: Vec<&str> = body.lines().collect();
            println!("{}", style::dim(&format!("{label} ({} lines):", lines.len())));
            for line in lines.iter().take(PREVIEW_LINES) {
                println!("  {line}");
            }
            if lines.len() > PREVIEW_LINES {
                println!("  {}", style::dim(&format!("[{} more lines]", lines.len() - PREVIEW_LINES)));
            }
        }
        None => match artifact {
            Some(_) => println!("{}", style::dim(&format!("{label}: directory"))),
            None => println!("{}", style::dim(&format!("{label}: deleted"))),
        },
    }
}

/// Open `$EDITOR` on the placeholder body. An aborted edit defers.
fn edit_content(conflict: &Conflict, placeholder: Option<&Artifact>) -> Option<ConflictChoice> {
    let seed = placeholder
        .or(conflict.local.as_ref())
        .and_then(Artifact::body)
        .unwrap_or_default();
    match Editor::new().edit(seed) {
        Ok(Some(body)) => Some(ConflictChoice::UseContent(body)),
        Ok(None) => Some(ConflictChoice::Defer),
        Err(e) => {
            warn!(error = %e, path = %conflict.full_path, "editor failed");
            None
        }
    }
}
