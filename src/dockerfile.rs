//! Best-effort Dockerfile reconstruction
//!
//! The image config keeps the command line of every build step in
//! `history[].created_by`. The recorded form depends on the builder:
//!
//! ```text
//! /bin/sh -c #(nop)  CMD ["sh"]                  classic builder, metadata step
//! /bin/sh -c #(nop) ADD file:1a2b in /           classic builder, ADD/COPY
//! /bin/sh -c apt-get update                      classic builder, RUN
//! |2 VERSION=1 USER=app /bin/sh -c make          classic builder, RUN with build args
//! RUN /bin/sh -c make # buildkit                 BuildKit
//! ```
//!
//! Reconstruction never fails; anything unrecognised is emitted as `RUN`.

use crate::store::imagedb::{HistoryEntry, RuntimeConfig};
use crate::store::ImageMetadata;
use regex::Regex;
use std::collections::BTreeMap;
use std::sync::OnceLock;

const SHELL_PREFIX: &str = "/bin/sh -c ";
const NOP_MARKER: &str = "#(nop)";

const INSTRUCTIONS: &[&str] = &[
    "ADD",
    "ARG",
    "CMD",
    "COPY",
    "ENTRYPOINT",
    "ENV",
    "EXPOSE",
    "HEALTHCHECK",
    "LABEL",
    "MAINTAINER",
    "ONBUILD",
    "RUN",
    "SHELL",
    "STOPSIGNAL",
    "USER",
    "VOLUME",
    "WORKDIR",
];

struct Patterns {
    build_args: Regex,
    buildkit: Regex,
    add_copy: Regex,
    expose_map: Regex,
}

fn patterns() -> &'static Patterns {
    static PATTERNS: OnceLock<Patterns> = OnceLock::new();
    PATTERNS.get_or_init(|| Patterns {
        build_args: Regex::new(r"^\|\d+\s+(?:\S+=\S*\s+)*").unwrap(),
        buildkit: Regex::new(r"\s*#\s*buildkit\s*$").unwrap(),
        add_copy: Regex::new(r"^(ADD|COPY)\s+(.+?)\s+in\s+(\S+)\s*$").unwrap(),
        expose_map: Regex::new(r"^EXPOSE\s+map\[(.*)\]\s*$").unwrap(),
    })
}

/// Dockerfile instruction for one `created_by` command string
pub fn history_instruction(created_by: &str) -> String {
    let patterns = patterns();
    let mut command = created_by.trim().to_string();

    command = patterns.buildkit.replace(&command, "").into_owned();
    command = patterns.build_args.replace(&command, "").into_owned();

    // BuildKit records RUN with its shell spelled out, build args first
    if let Some(rest) = command.strip_prefix("RUN ") {
        let rest = patterns.build_args.replace(rest.trim_start(), "");
        if let Some(script) = rest.strip_prefix(SHELL_PREFIX) {
            return format!("RUN {}", script.trim());
        }
    }

    let Some(script) = command.strip_prefix(SHELL_PREFIX) else {
        return if starts_with_instruction(&command) {
            normalize_instruction(&command)
        } else {
            format!("RUN {}", command)
        };
    };

    let script = script.trim();
    match script.strip_prefix(NOP_MARKER) {
        Some(instruction) => normalize_instruction(instruction.trim()),
        None => format!("RUN {}", script),
    }
}

fn starts_with_instruction(command: &str) -> bool {
    let keyword = command.split_whitespace().next().unwrap_or("");
    INSTRUCTIONS.contains(&keyword)
}

/// Rewrite builder-internal spellings into Dockerfile syntax
fn normalize_instruction(instruction: &str) -> String {
    let patterns = patterns();

    if let Some(caps) = patterns.add_copy.captures(instruction) {
        return format!("{} {} {}", &caps[1], &caps[2], &caps[3]);
    }

    if let Some(caps) = patterns.expose_map.captures(instruction) {
        let ports: Vec<&str> = caps[1]
            .split_whitespace()
            .map(|port| port.trim_end_matches(":{}"))
            .collect();
        return format!("EXPOSE {}", ports.join(" "));
    }

    instruction.to_string()
}

/// Render a Dockerfile for an image
pub fn reconstruct(metadata: &ImageMetadata) -> String {
    let mut lines = vec![
        format!("# Reconstructed from image {}", metadata.id),
        "# Base image unknown: the first layer holds the recovered root filesystem".to_string(),
        "# FROM <base image>".to_string(),
    ];

    let steps = history_lines(&metadata.history);
    if !steps.is_empty() {
        lines.push(String::new());
        lines.extend(steps);
    }

    if let Some(config) = &metadata.config {
        let runtime = runtime_lines(config);
        if !runtime.is_empty() {
            lines.push(String::new());
            lines.push("# Runtime configuration".to_string());
            lines.extend(runtime);
        }
    }

    let mut dockerfile = lines.join("\n");
    dockerfile.push('\n');
    dockerfile
}

fn history_lines(history: &[HistoryEntry]) -> Vec<String> {
    history
        .iter()
        .filter_map(|entry| {
            let created_by = entry.created_by.as_deref()?.trim();
            if created_by.is_empty() {
                return None;
            }
            let instruction = history_instruction(created_by);
            Some(if entry.empty_layer {
                format!("# (no layer) {}", instruction)
            } else {
                instruction
            })
        })
        .collect()
}

fn runtime_lines(config: &RuntimeConfig) -> Vec<String> {
    let mut lines = Vec::new();

    for env in config.env.iter().flatten() {
        lines.push(format!("ENV {}", env));
    }
    if let Some(ports) = non_empty(&config.exposed_ports) {
        lines.push(format!("EXPOSE {}", keys(ports)));
    }
    if let Some(volumes) = non_empty(&config.volumes) {
        lines.push(format!("VOLUME {}", keys(volumes)));
    }
    if let Some(dir) = config.working_dir.as_deref().filter(|d| !d.is_empty()) {
        lines.push(format!("WORKDIR {}", dir));
    }
    if let Some(user) = config.user.as_deref().filter(|u| !u.is_empty()) {
        lines.push(format!("USER {}", user));
    }
    for (key, value) in config.labels.iter().flatten() {
        lines.push(format!("LABEL {}={}", key, quote(value)));
    }
    if let Some(signal) = config.stop_signal.as_deref().filter(|s| !s.is_empty()) {
        lines.push(format!("STOPSIGNAL {}", signal));
    }
    if let Some(shell) = config.shell.as_ref().filter(|s| !s.is_empty()) {
        lines.push(format!("SHELL {}", json_form(shell)));
    }
    if let Some(entrypoint) = config.entrypoint.as_ref().filter(|e| !e.is_empty()) {
        lines.push(format!("ENTRYPOINT {}", json_form(entrypoint)));
    }
    if let Some(cmd) = config.cmd.as_ref().filter(|c| !c.is_empty()) {
        lines.push(format!("CMD {}", json_form(cmd)));
    }

    lines
}

fn non_empty<V>(map: &Option<BTreeMap<String, V>>) -> Option<&BTreeMap<String, V>> {
    map.as_ref().filter(|m| !m.is_empty())
}

fn keys<V>(map: &BTreeMap<String, V>) -> String {
    map.keys().map(String::as_str).collect::<Vec<_>>().join(" ")
}

fn quote(value: &str) -> String {
    serde_json::Value::from(value).to_string()
}

/// Exec form, e.g. `["-c", "echo hello"]`
fn json_form(args: &[String]) -> String {
    let items: Vec<String> = args.iter().map(|arg| quote(arg)).collect();
    format!("[{}]", items.join(", "))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn metadata(json: &str) -> ImageMetadata {
        ImageMetadata::parse("d69a5113cecd", Path::new("config"), json.as_bytes()).unwrap()
    }

    #[test]
    fn test_classic_builder_commands() {
        assert_eq!(
            history_instruction("/bin/sh -c #(nop)  CMD [\"sh\"]"),
            "CMD [\"sh\"]"
        );
        assert_eq!(
            history_instruction("/bin/sh -c #(nop) ADD file:6fef7a4ab2de57c43 in / "),
            "ADD file:6fef7a4ab2de57c43 /"
        );
        assert_eq!(
            history_instruction("/bin/sh -c #(nop) COPY dir:ab12 in /app"),
            "COPY dir:ab12 /app"
        );
        assert_eq!(
            history_instruction("/bin/sh -c apt-get update && apt-get install -y curl"),
            "RUN apt-get update && apt-get install -y curl"
        );
        assert_eq!(
            history_instruction("/bin/sh -c #(nop)  EXPOSE map[80/tcp:{} 443/tcp:{}]"),
            "EXPOSE 80/tcp 443/tcp"
        );
    }

    #[test]
    fn test_build_args_prefix() {
        assert_eq!(
            history_instruction("|2 VERSION=1.2 USER=app /bin/sh -c make install"),
            "RUN make install"
        );
    }

    #[test]
    fn test_buildkit_commands() {
        assert_eq!(
            history_instruction("RUN /bin/sh -c apk add --no-cache git # buildkit"),
            "RUN apk add --no-cache git"
        );
        assert_eq!(
            history_instruction("RUN |1 VERSION=1.2 /bin/sh -c make install # buildkit"),
            "RUN make install"
        );
        assert_eq!(
            history_instruction("RUN |2 A=1 B= /bin/sh -c echo $A # buildkit"),
            "RUN echo $A"
        );
        assert_eq!(history_instruction("COPY . /src # buildkit"), "COPY . /src");
        assert_eq!(history_instruction("WORKDIR /src"), "WORKDIR /src");
    }

    #[test]
    fn test_unknown_command_becomes_run() {
        assert_eq!(history_instruction("make all"), "RUN make all");
    }

    #[test]
    fn test_runtime_section() {
        let metadata = metadata(
            r#"{
                "config": {
                    "Env": ["PATH=/usr/local/bin"],
                    "ExposedPorts": {"80/tcp": {}},
                    "Volumes": {"/data": {}},
                    "Entrypoint": ["/bin/sh"],
                    "Cmd": ["-c", "echo hello"]
                },
                "rootfs": {"type": "layers", "diff_ids": []}
            }"#,
        );
        let content = reconstruct(&metadata);

        assert!(content.contains("ENV PATH=/usr/local/bin"));
        assert!(content.contains("EXPOSE 80/tcp"));
        assert!(content.contains("VOLUME /data"));
        assert!(content.contains("ENTRYPOINT [\"/bin/sh\"]"));
        assert!(content.contains("CMD [\"-c\", \"echo hello\"]"));
    }

    #[test]
    fn test_empty_layers_are_comments() {
        let metadata = metadata(
            r#"{
                "history": [
                    {"created_by": "/bin/sh -c #(nop) ADD file:abc in / "},
                    {"created_by": "/bin/sh -c #(nop)  CMD [\"sh\"]", "empty_layer": true},
                    {"comment": "no command recorded"}
                ],
                "rootfs": {"type": "layers", "diff_ids": ["sha256:aaa"]}
            }"#,
        );
        let content = reconstruct(&metadata);
        let lines: Vec<&str> = content.lines().collect();

        assert!(lines.contains(&"ADD file:abc /"));
        assert!(lines.contains(&"# (no layer) CMD [\"sh\"]"));
        assert!(!lines.contains(&"CMD [\"sh\"]"));
    }

    #[test]
    fn test_no_history_gives_placeholder_only() {
        let metadata = metadata(r#"{"rootfs": {"type": "layers", "diff_ids": []}}"#);
        let content = reconstruct(&metadata);
        assert!(content.lines().all(|line| line.starts_with('#')));
        assert!(content.contains("# FROM <base image>"));
    }
}
