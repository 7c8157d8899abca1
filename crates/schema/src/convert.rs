//! Dynamic-to-typed conversion and kind stamping.

use kestrel_core::Gvk;
use kube::core::{DynamicObject, TypeMeta};
use tracing::warn;

use crate::{ClusterObject, ConvertError, Scheme, SchemeError};

fn type_meta(gvk: &Gvk) -> TypeMeta {
    TypeMeta { api_version: gvk.api_version(), kind: gvk.kind.clone() }
}

impl Scheme {
    /// Convert a loosely-typed object into its registered type for `target`.
    ///
    /// Unregistered kinds come back unchanged as `ClusterObject::Raw`. The kind
    /// identifier is stamped on the result either way; a stamping failure is
    /// logged and the object is still returned.
    pub fn convert(&self, target: &Gvk, obj: DynamicObject) -> Result<ClusterObject, ConvertError> {
        self.try_convert(target, obj).map_err(|(e, _)| e)
    }

    /// Like [`Scheme::convert`], but content that does not decode into the
    /// registered type is kept in its dynamic form (stamped) instead of failing.
    pub fn convert_or_raw(&self, target: &Gvk, obj: DynamicObject) -> ClusterObject {
        match self.try_convert(target, obj) {
            Ok(out) => out,
            Err((e, obj)) => {
                warn!(gvk = %target, name = ?obj.metadata.name, error = %e, "conversion failed, keeping dynamic form");
                let mut out = ClusterObject::Raw(obj);
                if let Err(e) = self.stamp(&mut out, target) {
                    warn!(gvk = %target, error = %e, "kind stamping failed");
                }
                out
            }
        }
    }

    fn try_convert(&self, target: &Gvk, mut obj: DynamicObject) -> Result<ClusterObject, (ConvertError, DynamicObject)> {
        let mut out = match self.lookup(target) {
            Some(entry) => {
                // Listed/watched items usually arrive without apiVersion/kind.
                obj.types = Some(type_meta(target));
                let value = match serde_json::to_value(&obj) {
                    Ok(v) => v,
                    Err(e) => return Err((ConvertError::Encode(e), obj)),
                };
                match entry.decode(value) {
                    Ok(typed) => ClusterObject::Typed(typed),
                    Err(source) => return Err((ConvertError::Decode { gvk: target.clone(), source }, obj)),
                }
            }
            None => ClusterObject::Raw(obj),
        };
        if let Err(e) = self.stamp(&mut out, target) {
            warn!(gvk = %target, error = %e, "kind stamping failed");
        }
        Ok(out)
    }

    /// Write the resolved kind identifier onto `obj` and return it.
    ///
    /// Typed objects derive it from their variant. Raw objects take `target`
    /// when it names a kind, otherwise keep a well-formed wire TypeMeta.
    pub fn stamp(&self, obj: &mut ClusterObject, target: &Gvk) -> Result<Gvk, SchemeError> {
        match obj {
            ClusterObject::Typed(t) => Ok(t.gvk()),
            ClusterObject::Raw(d) => {
                if !target.kind.is_empty() && !target.version.is_empty() {
                    d.types = Some(type_meta(target));
                    return Ok(target.clone());
                }
                let wire = d
                    .types
                    .as_ref()
                    .and_then(|t| Gvk::from_api_version(&t.api_version, &t.kind).ok())
                    .filter(|g| !g.kind.is_empty());
                wire.ok_or_else(|| SchemeError::Unresolvable {
                    name: d.metadata.name.clone().unwrap_or_default(),
                })
            }
        }
    }
}
