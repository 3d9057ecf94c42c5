//! ClientState persistence format.
//!
//! Group state is stored as JSON with three encoding extensions so the
//! format stays portable across implementations:
//!
//! - byte strings become `"hex:" + lowercase hex`
//! - integers above the 53-bit safe range become `"bigint:" + decimal`
//! - maps become `{"__tag": "Map", "value": [[k, v], …]}`
//! - blank ratchet-tree slots are encoded as `null`
//!
//! The ciphersuite provider handle is environmental and is re-bound by the
//! engine on load; it never appears in the serialized form.

use std::collections::BTreeMap;

use serde_json::{json, Map, Value};

use super::{CodecError, Proposal, Result};
use crate::credential::Credential;
use crate::mls::{ClientState, ExporterSecret, ExtensionEntry, GroupId, RatchetNode};

/// Largest integer representable exactly in a JSON number.
const MAX_SAFE_INTEGER: u64 = (1 << 53) - 1;

fn bytes_value(bytes: &[u8]) -> Value {
    Value::String(format!("hex:{}", hex::encode(bytes)))
}

fn u64_value(v: u64) -> Value {
    if v > MAX_SAFE_INTEGER {
        Value::String(format!("bigint:{v}"))
    } else {
        Value::Number(v.into())
    }
}

fn map_value(entries: Vec<(Value, Value)>) -> Value {
    let value: Vec<Value> = entries
        .into_iter()
        .map(|(k, v)| Value::Array(vec![k, v]))
        .collect();
    json!({ "__tag": "Map", "value": value })
}

fn parse_bytes(value: &Value, field: &'static str) -> Result<Vec<u8>> {
    let s = value.as_str().ok_or(CodecError::InvalidField {
        field,
        reason: "expected hex string".to_string(),
    })?;
    let hex_str = s.strip_prefix("hex:").ok_or(CodecError::InvalidField {
        field,
        reason: "missing hex: prefix".to_string(),
    })?;
    hex::decode(hex_str).map_err(|e| CodecError::InvalidField {
        field,
        reason: e.to_string(),
    })
}

fn parse_u64(value: &Value, field: &'static str) -> Result<u64> {
    match value {
        Value::Number(n) => n.as_u64().ok_or(CodecError::InvalidField {
            field,
            reason: "expected unsigned integer".to_string(),
        }),
        Value::String(s) => {
            let digits = s.strip_prefix("bigint:").ok_or(CodecError::InvalidField {
                field,
                reason: "missing bigint: prefix".to_string(),
            })?;
            digits.parse().map_err(|_| CodecError::InvalidField {
                field,
                reason: format!("unparseable bigint {digits:?}"),
            })
        }
        _ => Err(CodecError::InvalidField {
            field,
            reason: "expected number or bigint string".to_string(),
        }),
    }
}

fn parse_map(value: &Value, field: &'static str) -> Result<Vec<(Value, Value)>> {
    let obj = value.as_object().ok_or(CodecError::InvalidField {
        field,
        reason: "expected Map object".to_string(),
    })?;
    if obj.get("__tag").and_then(Value::as_str) != Some("Map") {
        return Err(CodecError::InvalidField {
            field,
            reason: "missing __tag: Map".to_string(),
        });
    }
    let entries = obj
        .get("value")
        .and_then(Value::as_array)
        .ok_or(CodecError::InvalidField {
            field,
            reason: "Map missing value array".to_string(),
        })?;
    entries
        .iter()
        .map(|entry| {
            let pair = entry.as_array().filter(|a| a.len() == 2).ok_or(
                CodecError::InvalidField {
                    field,
                    reason: "Map entry is not a pair".to_string(),
                },
            )?;
            Ok((pair[0].clone(), pair[1].clone()))
        })
        .collect()
}

fn get<'a>(obj: &'a Map<String, Value>, field: &'static str) -> Result<&'a Value> {
    obj.get(field).ok_or(CodecError::InvalidField {
        field,
        reason: "missing field".to_string(),
    })
}

fn node_value(node: &RatchetNode) -> Value {
    json!({
        "encryptionKey": bytes_value(&node.encryption_key),
        "signatureKey": node.signature_key.as_deref().map_or(Value::Null, bytes_value),
        "credential": node.credential.as_ref().map_or(Value::Null, credential_value),
    })
}

fn credential_value(cred: &Credential) -> Value {
    json!({
        "credentialType": cred.credential_type,
        "identity": bytes_value(&cred.identity),
    })
}

fn parse_credential(value: &Value) -> Result<Credential> {
    let obj = value.as_object().ok_or(CodecError::InvalidField {
        field: "credential",
        reason: "expected object".to_string(),
    })?;
    let credential_type = u16::try_from(parse_u64(get(obj, "credentialType")?, "credentialType")?)
        .map_err(|_| CodecError::InvalidField {
            field: "credentialType",
            reason: "out of u16 range".to_string(),
        })?;
    Ok(Credential {
        credential_type,
        identity: parse_bytes(get(obj, "identity")?, "identity")?,
    })
}

fn parse_node(value: &Value) -> Result<RatchetNode> {
    let obj = value.as_object().ok_or(CodecError::InvalidField {
        field: "ratchetTree",
        reason: "expected node object or null".to_string(),
    })?;
    let signature_key = match get(obj, "signatureKey")? {
        Value::Null => None,
        v => Some(parse_bytes(v, "signatureKey")?),
    };
    let credential = match get(obj, "credential")? {
        Value::Null => None,
        v => Some(parse_credential(v)?),
    };
    Ok(RatchetNode {
        encryption_key: parse_bytes(get(obj, "encryptionKey")?, "encryptionKey")?,
        signature_key,
        credential,
    })
}

/// Serializes a client state to its JSON storage form.
///
/// # Errors
///
/// Fails only if a pending proposal fails to encode.
pub fn encode_client_state(state: &ClientState) -> Result<String> {
    let extensions: Vec<Value> = state
        .extensions
        .iter()
        .map(|ext| {
            json!({
                "extensionType": ext.extension_type,
                "data": bytes_value(&ext.data),
            })
        })
        .collect();

    let ratchet_tree: Vec<Value> = state
        .ratchet_tree
        .iter()
        .map(|slot| slot.as_ref().map_or(Value::Null, node_value))
        .collect();

    let exporter_secrets = map_value(
        state
            .exporter_secrets
            .iter()
            .map(|(epoch, secret)| (u64_value(*epoch), bytes_value(secret.as_bytes())))
            .collect(),
    );

    let unapplied: Result<Vec<(Value, Value)>> = state
        .unapplied_proposals
        .iter()
        .map(|(r, p)| Ok((Value::String(r.clone()), bytes_value(&p.encode()?))))
        .collect();
    let unapplied_proposals = map_value(unapplied?);

    let doc = json!({
        "groupId": bytes_value(state.group_id.as_slice()),
        "epoch": u64_value(state.epoch),
        "ciphersuite": state.ciphersuite,
        "extensions": extensions,
        "ratchetTree": ratchet_tree,
        "ownLeafIndex": state.own_leaf_index,
        "initSecret": bytes_value(&state.init_secret),
        "exporterSecrets": exporter_secrets,
        "unappliedProposals": unapplied_proposals,
    });
    Ok(doc.to_string())
}

/// Deserializes a client state from its JSON storage form.
///
/// # Errors
///
/// Fails on malformed JSON, missing fields, or invalid encodings.
pub fn decode_client_state(input: &str) -> Result<ClientState> {
    let doc: Value = serde_json::from_str(input)?;
    let obj = doc.as_object().ok_or(CodecError::InvalidField {
        field: "ClientState",
        reason: "expected top-level object".to_string(),
    })?;

    let group_id = GroupId::from_slice(&parse_bytes(get(obj, "groupId")?, "groupId")?);
    let epoch = parse_u64(get(obj, "epoch")?, "epoch")?;
    let ciphersuite = u16::try_from(parse_u64(get(obj, "ciphersuite")?, "ciphersuite")?)
        .map_err(|_| CodecError::InvalidField {
            field: "ciphersuite",
            reason: "out of u16 range".to_string(),
        })?;

    let extensions = get(obj, "extensions")?
        .as_array()
        .ok_or(CodecError::InvalidField {
            field: "extensions",
            reason: "expected array".to_string(),
        })?
        .iter()
        .map(|ext| {
            let ext_obj = ext.as_object().ok_or(CodecError::InvalidField {
                field: "extensions",
                reason: "expected object".to_string(),
            })?;
            let extension_type =
                u16::try_from(parse_u64(get(ext_obj, "extensionType")?, "extensionType")?)
                    .map_err(|_| CodecError::InvalidField {
                        field: "extensionType",
                        reason: "out of u16 range".to_string(),
                    })?;
            Ok(ExtensionEntry {
                extension_type,
                data: parse_bytes(get(ext_obj, "data")?, "data")?,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    let ratchet_tree = get(obj, "ratchetTree")?
        .as_array()
        .ok_or(CodecError::InvalidField {
            field: "ratchetTree",
            reason: "expected array".to_string(),
        })?
        .iter()
        .map(|slot| match slot {
            Value::Null => Ok(None),
            v => parse_node(v).map(Some),
        })
        .collect::<Result<Vec<_>>>()?;

    let own_leaf_index = u32::try_from(parse_u64(get(obj, "ownLeafIndex")?, "ownLeafIndex")?)
        .map_err(|_| CodecError::InvalidField {
            field: "ownLeafIndex",
            reason: "out of u32 range".to_string(),
        })?;

    let init_secret = parse_bytes(get(obj, "initSecret")?, "initSecret")?;

    let mut exporter_secrets = BTreeMap::new();
    for (k, v) in parse_map(get(obj, "exporterSecrets")?, "exporterSecrets")? {
        let epoch = parse_u64(&k, "exporterSecrets")?;
        let bytes = parse_bytes(&v, "exporterSecrets")?;
        let secret: [u8; 32] = bytes.try_into().map_err(|_| CodecError::InvalidField {
            field: "exporterSecrets",
            reason: "secret is not 32 bytes".to_string(),
        })?;
        exporter_secrets.insert(epoch, ExporterSecret(secret));
    }

    let mut unapplied_proposals = BTreeMap::new();
    for (k, v) in parse_map(get(obj, "unappliedProposals")?, "unappliedProposals")? {
        let proposal_ref = k
            .as_str()
            .ok_or(CodecError::InvalidField {
                field: "unappliedProposals",
                reason: "ref is not a string".to_string(),
            })?
            .to_string();
        let proposal = Proposal::decode(&parse_bytes(&v, "unappliedProposals")?)?;
        unapplied_proposals.insert(proposal_ref, proposal);
    }

    Ok(ClientState {
        group_id,
        epoch,
        ciphersuite,
        extensions,
        ratchet_tree,
        own_leaf_index,
        init_secret,
        exporter_secrets,
        unapplied_proposals,
    })
}
