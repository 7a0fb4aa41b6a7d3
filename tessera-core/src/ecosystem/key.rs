//! Deterministic node ids.
//!
//! A node id is its template key, followed by the params serialized as JSON
//! with object keys sorted. Unit params leave the bare key. Values that should
//! hash by identity serialize as a marker (`{"@ref": n}` for [`Ref`],
//! `{"@node": id}` for [`NodeRef`]), never by their contents.
//!
//! [`Ref`]: crate::reactive::Ref
//! [`NodeRef`]: crate::graph::NodeRef

use std::fmt::Write;

use serde::Serialize;
use serde_json::Value;

use crate::error::{Error, Result};

pub(crate) fn node_id<P: Serialize>(key: &str, params: &P) -> Result<String> {
    let value = serde_json::to_value(params).map_err(|error| Error::serialization(key, error))?;
    if value.is_null() {
        return Ok(key.to_owned());
    }
    let mut id = String::with_capacity(key.len() + 16);
    id.push_str(key);
    id.push('-');
    write_canonical(&value, &mut id);
    Ok(id)
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<_> = map.iter().collect();
            entries.sort_unstable_by(|a, b| a.0.cmp(b.0));
            out.push('{');
            for (index, (key, value)) in entries.into_iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                let _ = write!(out, "{}", Value::String(key.clone()));
                out.push(':');
                write_canonical(value, out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (index, item) in items.iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => {
            let _ = write!(out, "{scalar}");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use serde_json::json;

    use super::*;
    use crate::graph::{NodeId, NodeRef};
    use crate::reactive::Ref;

    #[test]
    fn unit_params_keep_the_bare_key() {
        assert_eq!(node_id("count", &()).unwrap(), "count");
    }

    #[test]
    fn params_are_canonical() {
        let a = json!({"b": 1, "a": [true, "x"]});
        assert_eq!(node_id("user", &a).unwrap(), r#"user-{"a":[true,"x"],"b":1}"#);

        let mut map = HashMap::new();
        map.insert("zeta", 1);
        map.insert("alpha", 2);
        assert_eq!(node_id("m", &map).unwrap(), r#"m-{"alpha":2,"zeta":1}"#);
    }

    #[test]
    fn references_hash_by_identity() {
        let first = Ref::new(vec![0_u8; 4]);
        let second = Ref::new(vec![0_u8; 4]);
        assert_ne!(
            node_id("blob", &first).unwrap(),
            node_id("blob", &second).unwrap()
        );

        let node = NodeRef::new(NodeId::new(), "count");
        assert_eq!(node_id("view", &(node, 2)).unwrap(), r#"view-[{"@node":"count"},2]"#);
    }
}
