//! Connection edges: `(cell, output) -> (cell, input)`.

use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Endpoint {
    pub cell: String,
    pub port: String,
}

impl Endpoint {
    pub fn new(cell: &str, port: &str) -> Self {
        Self {
            cell: cell.to_string(),
            port: port.to_string(),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.cell, self.port)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Edge {
    pub from: Endpoint,
    pub to: Endpoint,
}

impl fmt::Display for Edge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} >> {}", self.from, self.to)
    }
}

/// Single edge `src[src_port] >> dst[dst_port]`.
pub fn edge(src: (&str, &str), dst: (&str, &str)) -> Edge {
    Edge {
        from: Endpoint::new(src.0, src.1),
        to: Endpoint::new(dst.0, dst.1),
    }
}

/// Pairwise edges `src[a, b, ..] >> dst[x, y, ..]`.
///
/// Port lists are zipped; a length mismatch yields an edge to a port named
/// after the missing side so that graph resolution reports it as dangling.
pub fn edges(src: &str, src_ports: &[&str], dst: &str, dst_ports: &[&str]) -> Vec<Edge> {
    let n = src_ports.len().max(dst_ports.len());
    (0..n)
        .map(|i| {
            edge(
                (src, src_ports.get(i).copied().unwrap_or("<missing>")),
                (dst, dst_ports.get(i).copied().unwrap_or("<missing>")),
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn zips_port_lists() {
        let got = edges("matcher", &["matches", "matches_3d"], "guess", &["matches", "matches_3d"]);
        assert_eq!(
            got.iter().map(|e| e.to_string()).collect::<Vec<_>>(),
            vec![
                "matcher[matches] >> guess[matches]",
                "matcher[matches_3d] >> guess[matches_3d]"
            ]
        );
    }

    #[test]
    fn length_mismatch_produces_an_unresolvable_port() {
        let got = edges("a", &["x", "y"], "b", &["x"]);
        assert_eq!(got[1].to.port, "<missing>");
    }
}
