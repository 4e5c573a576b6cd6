//! Parsed D-Bus type signatures.
//!
//! `zvariant::Signature` validates that a signature string is well-formed but (being serde-driven)
//! doesn't hand back a walkable tree — callers are expected to know the shape at compile time via
//! the `Type` trait. Since this crate bridges *dynamic* values (method bodies whose shape is only
//! known from introspection, §4.7), it needs exactly that tree, so `SignatureTree` builds one.

use std::fmt;
use std::iter::Peekable;
use std::str::Chars;

use zvariant::Signature;

use crate::error::{Error, Result};

/// A single node of a parsed D-Bus type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypeNode {
    /// A basic (non-container) type, identified by its D-Bus type code
    /// (`y b n q i u x t d s o g` and `h`).
    Basic(char),
    /// `a` followed by a single contained type.
    Array(Box<TypeNode>),
    /// `a{kv}` — a dict-entry array; `key` is always a basic type per the D-Bus spec.
    Dict(Box<TypeNode>, Box<TypeNode>),
    /// `(...)` — a fixed-arity heterogeneous sequence.
    Struct(Vec<TypeNode>),
    /// `v` — a self-describing value; the concrete type travels with the value itself.
    Variant,
}

impl TypeNode {
    /// Whether the node is a container kind per §3's `SignatureTree` data model
    /// (basic/array/dict/struct/variant).
    pub fn is_container(&self) -> bool {
        !matches!(self, TypeNode::Basic(_))
    }
}

/// A parsed tree for exactly one complete D-Bus type, plus the signature string it was built
/// from (kept for error messages and for round-tripping through the wire).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureTree {
    root: TypeNode,
    signature: String,
}

impl SignatureTree {
    /// Parse a signature string that must contain exactly one complete type (e.g. a single
    /// method argument, or a property's type).
    pub fn parse(sig: &str) -> Result<Self> {
        // Validate against zvariant's own grammar check first; it is the authority on what a
        // legal signature looks like, we only add the tree-shape on top.
        Signature::try_from(sig)?;

        let mut chars = sig.chars().peekable();
        let root = parse_one(&mut chars)?;
        if chars.next().is_some() {
            return Err(Error::Protocol(format!(
                "signature {sig:?} contains more than one complete type"
            )));
        }
        Ok(SignatureTree {
            root,
            signature: sig.to_string(),
        })
    }

    /// Split a (possibly multi-argument) signature string into one `SignatureTree` per
    /// top-level complete type — used for method input/output lists (§4.2).
    pub fn parse_many(sig: &str) -> Result<Vec<Self>> {
        Signature::try_from(sig)?;

        let mut trees = Vec::new();
        let mut rest = sig;
        while !rest.is_empty() {
            let mut chars = rest.chars().peekable();
            let node = parse_one(&mut chars)?;
            let consumed = rest.len() - chars_remaining_byte_len(&chars);
            let (piece, tail) = rest.split_at(consumed);
            trees.push(SignatureTree {
                root: node,
                signature: piece.to_string(),
            });
            rest = tail;
        }
        Ok(trees)
    }

    /// The root type node.
    pub fn root(&self) -> &TypeNode {
        &self.root
    }

    /// The original signature string.
    pub fn as_str(&self) -> &str {
        &self.signature
    }

    /// Concatenate several trees back into one signature string (the inverse of
    /// [`parse_many`](Self::parse_many)), used when marshalling multi-output method returns.
    pub fn concat(trees: &[SignatureTree]) -> String {
        trees.iter().map(|t| t.as_str()).collect()
    }
}

impl fmt::Display for SignatureTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.signature)
    }
}

/// Byte length still left in a `Peekable<Chars>`, used to figure out how much of the original
/// `&str` one call to `parse_one` consumed.
fn chars_remaining_byte_len(chars: &Peekable<Chars<'_>>) -> usize {
    chars.clone().map(|c| c.len_utf8()).sum()
}

fn parse_one(chars: &mut Peekable<Chars<'_>>) -> Result<TypeNode> {
    let c = chars
        .next()
        .ok_or_else(|| Error::Protocol("unexpected end of signature".into()))?;
    match c {
        'y' | 'b' | 'n' | 'q' | 'i' | 'u' | 'x' | 't' | 'd' | 's' | 'o' | 'g' | 'h' => {
            Ok(TypeNode::Basic(c))
        }
        'v' => Ok(TypeNode::Variant),
        'a' => {
            if chars.peek() == Some(&'{') {
                chars.next(); // consume '{'
                let key = parse_one(chars)?;
                if !matches!(key, TypeNode::Basic(_)) {
                    return Err(Error::Protocol(
                        "dict entry key must be a basic type".into(),
                    ));
                }
                let value = parse_one(chars)?;
                match chars.next() {
                    Some('}') => Ok(TypeNode::Dict(Box::new(key), Box::new(value))),
                    _ => Err(Error::Protocol("unterminated dict entry, expected '}'".into())),
                }
            } else {
                let element = parse_one(chars)?;
                Ok(TypeNode::Array(Box::new(element)))
            }
        }
        '(' => {
            let mut fields = Vec::new();
            loop {
                match chars.peek() {
                    Some(')') => {
                        chars.next();
                        break;
                    }
                    Some(_) => fields.push(parse_one(chars)?),
                    None => {
                        return Err(Error::Protocol("unterminated struct, expected ')'".into()))
                    }
                }
            }
            Ok(TypeNode::Struct(fields))
        }
        other => Err(Error::Protocol(format!("unknown type code '{other}'"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_basic() {
        let t = SignatureTree::parse("u").unwrap();
        assert_eq!(t.root(), &TypeNode::Basic('u'));
    }

    #[test]
    fn parses_array_of_string() {
        let t = SignatureTree::parse("as").unwrap();
        assert_eq!(t.root(), &TypeNode::Array(Box::new(TypeNode::Basic('s'))));
    }

    #[test]
    fn parses_dict() {
        let t = SignatureTree::parse("a{sv}").unwrap();
        assert_eq!(
            t.root(),
            &TypeNode::Dict(Box::new(TypeNode::Basic('s')), Box::new(TypeNode::Variant))
        );
    }

    #[test]
    fn parses_struct() {
        let t = SignatureTree::parse("(bds)").unwrap();
        assert_eq!(
            t.root(),
            &TypeNode::Struct(vec![
                TypeNode::Basic('b'),
                TypeNode::Basic('d'),
                TypeNode::Basic('s'),
            ])
        );
    }

    #[test]
    fn parse_many_splits_top_level_types() {
        let trees = SignatureTree::parse_many("sbi").unwrap();
        assert_eq!(trees.len(), 3);
        assert_eq!(trees[0].as_str(), "s");
        assert_eq!(trees[1].as_str(), "b");
        assert_eq!(trees[2].as_str(), "i");
    }

    #[test]
    fn parse_many_handles_nested_types() {
        let trees = SignatureTree::parse_many("a{sv}(ii)s").unwrap();
        assert_eq!(trees.len(), 3);
        assert_eq!(trees[0].as_str(), "a{sv}");
        assert_eq!(trees[1].as_str(), "(ii)");
        assert_eq!(trees[2].as_str(), "s");
    }

    #[test]
    fn rejects_unterminated_struct() {
        assert!(SignatureTree::parse("(bs").is_err());
    }

    #[test]
    fn single_parse_rejects_multiple_types() {
        assert!(SignatureTree::parse("ss").is_err());
    }
}
