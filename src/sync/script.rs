//! Generation of the `sync.sh` apply script embedded in every batch
//!
//! The script runs at the target as `/bin/sh sync.sh <batchDir> <sourceNodeId>
//! <fileList>`. For every event it sets a few shell variables, runs the
//! trigger's before hook, copies or deletes the file, appends
//! `<targetFile>=<C|M|D>` to the file list and runs the after hook. Hooks are
//! shell fragments and may change `targetBaseDir`, `targetRelativeDir`,
//! `targetFileName` or set `processFile=false`.
//!
//! Target base dirs are emitted unexpanded: `${name}` tokens resolve at the
//! target, where the loader exports its path variables to the script.

use std::fmt::Write;

use crate::snapshot::FileSnapshot;
use crate::types::{ConflictStrategy, FileTriggerRouter, LastEventType, ROOT_RELATIVE_DIR};

/// Exit code of the script when a conflict needs manual resolution
pub const CONFLICT_EXIT_CODE: i32 = 3;

const HEADER: &str = r#"batchDir="$1"
sourceNodeId="$2"
fileList="$3"
: > "$fileList" || exit 1

# CRC32 from the gzip trailer (little-endian hosts)
crc32() { gzip -c < "$1" | tail -c 8 | od -An -N4 -tu4 | tr -d ' \n'; }
"#;

/// Quote a value for the shell with no expansion at all
pub fn single_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r#"'\''"#))
}

/// Quote a directory for the shell, keeping `${name}` tokens and a leading `~`
/// expandable and everything else literal
pub fn path_literal(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len() + 2);
    out.push('"');

    let mut rest = raw;
    if let Some(stripped) = rest.strip_prefix('~') {
        if stripped.is_empty() || stripped.starts_with('/') {
            out.push_str("$HOME");
            rest = stripped;
        }
    }

    while let Some(c) = rest.chars().next() {
        if let Some(name) = variable_token(rest) {
            out.push_str("${");
            out.push_str(name);
            out.push('}');
            rest = &rest[name.len() + 3..];
            continue;
        }
        if matches!(c, '"' | '\\' | '$' | '`') {
            out.push('\\');
        }
        out.push(c);
        rest = &rest[c.len_utf8()..];
    }

    out.push('"');
    out
}

/// Name of a `${name}` token at the start of `s`
fn variable_token(s: &str) -> Option<&str> {
    let inner = s.strip_prefix("${")?;
    let end = inner.find('}')?;
    let name = &inner[..end];
    let mut chars = name.chars();
    let first = chars.next()?;
    let valid = (first.is_ascii_alphabetic() || first == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    valid.then_some(name)
}

/// Builds the script for one batch
pub struct ScriptBuilder {
    script: String,
}

impl ScriptBuilder {
    pub fn new(batch_id: i64, source_node_id: &str, channel_id: &str) -> Self {
        let mut script = String::from("#!/bin/sh\n");
        let _ = writeln!(
            script,
            "# batch {} from {} on channel {}",
            batch_id, source_node_id, channel_id
        );
        script.push_str(HEADER);
        Self { script }
    }

    fn begin_entry(
        &mut self,
        rule: &FileTriggerRouter,
        file: &FileSnapshot,
        event: LastEventType,
    ) {
        let relative_dir = if file.relative_dir == ROOT_RELATIVE_DIR {
            ""
        } else {
            file.relative_dir.as_str()
        };

        let s = &mut self.script;
        let _ = writeln!(s, "\n# {} {}", event.as_str(), file.relative_path());
        let _ = writeln!(s, "targetBaseDir={}", path_literal(rule.raw_target_base_dir()));
        s.push_str("processFile=true\n");
        let _ = writeln!(s, "sourceFileName={}", single_quote(&file.file_name));
        let _ = writeln!(
            s,
            "sourceFilePath=\"$batchDir\"/{}",
            single_quote(&file.relative_path())
        );
        let _ = writeln!(s, "targetRelativeDir={}", single_quote(relative_dir));
        s.push_str("targetFileName=\"$sourceFileName\"\n");

        if let Some(hook) = non_blank(&rule.trigger.before_copy_script) {
            s.push_str(hook);
            s.push('\n');
        }

        s.push_str("if [ \"$processFile\" = true ]; then\n");
        s.push_str("  targetDir=\"$targetBaseDir${targetRelativeDir:+/$targetRelativeDir}\"\n");
        s.push_str("  targetFile=\"$targetDir/$targetFileName\"\n");
    }

    fn end_entry(&mut self, rule: &FileTriggerRouter, event: LastEventType) {
        let s = &mut self.script;
        let _ = writeln!(
            s,
            "  printf '%s=%s\\n' \"$targetFile\" {} >> \"$fileList\"",
            event.as_str()
        );
        s.push_str("fi\n");
        if let Some(hook) = non_blank(&rule.trigger.after_copy_script) {
            s.push_str(hook);
            s.push('\n');
        }
    }

    /// Copy a file or create a directory shipped in the batch.
    ///
    /// `verify_crc` means the source tracked checksums, so a Modify can tell
    /// whether the target still holds the version it replaces.
    pub fn add_copy(
        &mut self,
        rule: &FileTriggerRouter,
        file: &FileSnapshot,
        is_dir: bool,
        verify_crc: bool,
    ) {
        let event = file.last_event_type.unwrap_or(LastEventType::Modify);
        self.begin_entry(rule, file, event);

        let s = &mut self.script;
        s.push_str("  mkdir -p \"$targetDir\" || exit 1\n");

        if is_dir {
            s.push_str("  if [ ! -d \"$targetFile\" ]; then\n");
            s.push_str("    mkdir -p \"$targetFile\" || exit 1\n");
            s.push_str("  fi\n");
            self.end_entry(rule, event);
            return;
        }

        s.push_str("  if [ -d \"$targetFile\" ]; then\n");
        s.push_str("    processFile=false\n");
        s.push_str(
            "  elif [ -f \"$targetFile\" ] && cmp -s \"$sourceFilePath\" \"$targetFile\"; then\n",
        );
        s.push_str("    processFile=false\n");

        if rule.conflict_strategy != ConflictStrategy::SourceWins {
            let expected = match (event, file.old_crc32_checksum) {
                (LastEventType::Modify, Some(old)) if verify_crc => Some(old),
                _ => None,
            };
            let in_conflict = match (event, expected) {
                // target exists and differs from the incoming content
                (LastEventType::Create, _) => Some("[ -f \"$targetFile\" ]".to_string()),
                (_, Some(old)) => Some(format!(
                    "[ -f \"$targetFile\" ] && [ \"$(crc32 \"$targetFile\")\" != \"{}\" ]",
                    old
                )),
                _ => None,
            };

            if let Some(test) = in_conflict {
                let _ = writeln!(s, "  elif {}; then", test);
                if rule.conflict_strategy == ConflictStrategy::Manual {
                    s.push_str(
                        "    echo \"Conflict on $targetFile needs manual resolution\" >&2\n",
                    );
                    let _ = writeln!(s, "    exit {}", CONFLICT_EXIT_CODE);
                } else {
                    s.push_str("    echo \"Conflict on $targetFile, keeping target\"\n");
                    s.push_str("    processFile=false\n");
                }
            }
        }

        s.push_str("  fi\n");
        s.push_str("  if [ \"$processFile\" = true ]; then\n");
        s.push_str("    cp -p \"$sourceFilePath\" \"$targetFile\" || exit 1\n");
        s.push_str("  fi\n");
        self.end_entry(rule, event);
    }

    /// Remove the target file or directory
    pub fn add_delete(&mut self, rule: &FileTriggerRouter, file: &FileSnapshot) {
        self.begin_entry(rule, file, LastEventType::Delete);
        self.script.push_str("  rm -rf \"$targetFile\" || exit 1\n");
        self.end_entry(rule, LastEventType::Delete);
    }

    pub fn finish(mut self) -> String {
        self.script.push_str("\nexit 0\n");
        self.script
    }
}

fn non_blank(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{FileRouter, FileTrigger};

    fn rule() -> FileTriggerRouter {
        FileTriggerRouter::new(
            FileTrigger::new("docs", "/data/docs"),
            FileRouter {
                router_id: "corp_2_store".into(),
                source_node_group_id: "corp".into(),
                target_node_group_id: "store".into(),
            },
        )
    }

    fn file(dir: &str, name: &str, event: LastEventType) -> FileSnapshot {
        let mut file = FileSnapshot::new(&rule(), dir, name);
        file.last_event_type = Some(event);
        file
    }

    #[test]
    fn test_single_quote() {
        assert_eq!(single_quote("a.txt"), "'a.txt'");
        assert_eq!(single_quote("it's"), r#"'it'\''s'"#);
    }

    #[test]
    fn test_path_literal_keeps_variables() {
        assert_eq!(path_literal("/srv/docs"), "\"/srv/docs\"");
        assert_eq!(path_literal("${appRoot}/docs"), "\"${appRoot}/docs\"");
        assert_eq!(path_literal("~/docs"), "\"$HOME/docs\"");
        assert_eq!(path_literal("/a$b/`x`"), "\"/a\\$b/\\`x\\`\"");
        assert_eq!(path_literal("${not valid}"), "\"\\${not valid}\"");
    }

    #[test]
    fn test_copy_entry() {
        let mut builder = ScriptBuilder::new(1001, "corp-000", "filesync");
        builder.add_copy(&rule(), &file("sub", "a.txt", LastEventType::Create), false, false);
        let script = builder.finish();

        assert!(script.starts_with("#!/bin/sh\n# batch 1001 from corp-000 on channel filesync\n"));
        assert!(script.contains("sourceFilePath=\"$batchDir\"/'sub/a.txt'"));
        assert!(script.contains("targetRelativeDir='sub'"));
        assert!(script.contains("cp -p \"$sourceFilePath\" \"$targetFile\""));
        assert!(script.contains("\"$targetFile\" C >> \"$fileList\""));
        assert!(!script.contains("Conflict"));
        assert!(script.ends_with("exit 0\n"));
    }

    #[test]
    fn test_delete_entry_at_root() {
        let mut builder = ScriptBuilder::new(1, "corp-000", "filesync");
        builder.add_delete(&rule(), &file(".", "gone.txt", LastEventType::Delete));
        let script = builder.finish();

        assert!(script.contains("targetRelativeDir=''"));
        assert!(script.contains("rm -rf \"$targetFile\""));
        assert!(script.contains("\"$targetFile\" D >> \"$fileList\""));
    }

    #[test]
    fn test_hooks_wrap_entry() {
        let mut rule = rule();
        rule.trigger.before_copy_script = Some("targetFileName=\"renamed.txt\"".into());
        rule.trigger.after_copy_script = Some("echo done".into());

        let mut builder = ScriptBuilder::new(1, "corp-000", "filesync");
        builder.add_copy(&rule, &file(".", "a.txt", LastEventType::Modify), false, false);
        let script = builder.finish();

        let before = script.find("targetFileName=\"renamed.txt\"").unwrap();
        let copy = script.find("cp -p").unwrap();
        let after = script.find("echo done").unwrap();
        assert!(before < copy && copy < after);
    }

    #[test]
    fn test_conflict_checks_follow_strategy() {
        let mut rule = rule();
        rule.conflict_strategy = ConflictStrategy::Manual;
        let mut modified = file(".", "a.txt", LastEventType::Modify);
        modified.old_crc32_checksum = Some(12345);

        let mut builder = ScriptBuilder::new(1, "corp-000", "filesync");
        builder.add_copy(&rule, &modified, false, true);
        let script = builder.finish();
        assert!(script.contains("!= \"12345\""));
        assert!(script.contains("exit 3"));

        rule.conflict_strategy = ConflictStrategy::TargetWins;
        let mut builder = ScriptBuilder::new(1, "corp-000", "filesync");
        builder.add_copy(&rule, &modified, false, false);
        let script = builder.finish();
        // without source checksums a modify cannot detect a conflict
        assert!(!script.contains("crc32 \"$targetFile\""));
    }
}
