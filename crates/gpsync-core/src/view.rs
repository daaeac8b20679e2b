use crate::{PortRegistry, PortStatus};
use std::fmt::Write;

pub const PORTS_GROUP_LABEL: &str = "Forwarded Ports";

/// Node of the workspace tree shown to users: the ports group and its ports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkspaceNode {
    PortsGroup,
    Port(PortStatus),
}

impl WorkspaceNode {
    pub fn label(&self) -> String {
        match self {
            WorkspaceNode::PortsGroup => PORTS_GROUP_LABEL.to_string(),
            WorkspaceNode::Port(port) => format!(":{}", port.local_port),
        }
    }

    pub fn description(&self) -> Option<String> {
        match self {
            WorkspaceNode::PortsGroup => None,
            WorkspaceNode::Port(port) => Some(match port.global_port {
                Some(global_port) => format!("{} -> {global_port}", port.description()),
                None => port.description().to_string(),
            }),
        }
    }
}

/// Children of `node`, or the roots when `node` is `None`.
pub fn children(ports: &PortRegistry, node: Option<&WorkspaceNode>) -> Vec<WorkspaceNode> {
    match node {
        None => vec![WorkspaceNode::PortsGroup],
        Some(WorkspaceNode::PortsGroup) => ports
            .snapshot()
            .into_iter()
            .map(WorkspaceNode::Port)
            .collect(),
        Some(WorkspaceNode::Port(_)) => Vec::new(),
    }
}

pub fn render_tree(ports: &PortRegistry) -> String {
    let mut out = String::new();
    for root in children(ports, None) {
        render_node(ports, &root, 0, &mut out);
    }
    out
}

fn render_node(ports: &PortRegistry, node: &WorkspaceNode, depth: usize, out: &mut String) {
    let indent = "  ".repeat(depth);
    let _ = match node.description() {
        Some(description) => writeln!(out, "{indent}{} {description}", node.label()),
        None => writeln!(out, "{indent}{}", node.label()),
    };
    for child in children(ports, Some(node)) {
        render_node(ports, &child, depth + 1, out);
    }
}
