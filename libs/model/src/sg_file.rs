//! The `"<source>,<group>"` line format shared by the egress join file and
//! the ingress assignment export.
//!
//! Blank lines and lines starting with `#` are ignored. Malformed lines are
//! logged and skipped so one bad entry cannot take down the whole join set.

use crate::Sg;

pub fn parse(contents: &str) -> Vec<Sg> {
    let mut sgs = Vec::new();

    for (idx, raw) in contents.lines().enumerate() {
        let line = raw.trim();

        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        match line.parse::<Sg>() {
            Ok(sg) => sgs.push(sg),
            Err(e) => {
                tracing::warn!(line_num = idx + 1, %line, "Skipping malformed (S,G) line: {e}");
            }
        }
    }

    sgs
}

pub fn render<'a>(sgs: impl IntoIterator<Item = &'a Sg>) -> String {
    let mut out = String::new();

    for sg in sgs {
        out.push_str(&format!("{},{}\n", sg.source(), sg.group()));
    }

    out
}
