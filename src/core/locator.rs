//! Locators: `endo://<node>/?id=<number>&type=<formulaType>`.

use url::Url;

use super::error::{CoreError, InvalidLocator};
use super::formula::FormulaType;
use super::identifier::{FormulaId, FormulaNumber, NodeId};

pub const LOCATOR_SCHEME: &str = "endo";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Locator {
    pub id: FormulaId,
    pub formula_type: FormulaType,
}

impl Locator {
    pub fn new(id: FormulaId, formula_type: FormulaType) -> Self {
        Self { id, formula_type }
    }

    pub fn node(&self) -> &NodeId {
        self.id.node()
    }
}

pub fn format_locator(id: &FormulaId, formula_type: FormulaType) -> String {
    format!(
        "{LOCATOR_SCHEME}://{}/?id={}&type={}",
        id.node(),
        id.number(),
        formula_type
    )
}

pub fn parse_locator(raw: &str) -> Result<Locator, CoreError> {
    let invalid = |reason: String| -> CoreError {
        InvalidLocator {
            raw: raw.to_string(),
            reason,
        }
        .into()
    };

    let url = Url::parse(raw).map_err(|e| invalid(format!("not a URL: {e}")))?;
    if url.scheme() != LOCATOR_SCHEME {
        return Err(invalid(format!("scheme `{}` is not `endo`", url.scheme())));
    }
    if !url.username().is_empty() || url.password().is_some() || url.port().is_some() {
        return Err(invalid("unexpected userinfo or port".into()));
    }
    let host = url.host_str().ok_or_else(|| invalid("missing node".into()))?;
    let node = NodeId::parse(host).map_err(|e| invalid(e.to_string()))?;

    let mut id = None;
    let mut ty = None;
    for (key, value) in url.query_pairs() {
        let slot = match key.as_ref() {
            "id" => &mut id,
            "type" => &mut ty,
            other => return Err(invalid(format!("unexpected query parameter `{other}`"))),
        };
        if slot.replace(value.into_owned()).is_some() {
            return Err(invalid(format!("duplicate query parameter `{key}`")));
        }
    }
    let (Some(number), Some(ty)) = (id, ty) else {
        return Err(invalid("expected exactly `id` and `type` parameters".into()));
    };
    let number = FormulaNumber::parse(&number).map_err(|e| invalid(e.to_string()))?;
    let formula_type = ty
        .parse::<FormulaType>()
        .map_err(|e| invalid(e.to_string()))?;

    Ok(Locator {
        id: FormulaId::new(number, node),
        formula_type,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn sample_id() -> FormulaId {
        FormulaId::new(FormulaNumber::generate(), NodeId::generate())
    }

    #[test]
    fn rejects_other_schemes_and_params() {
        let id = sample_id();
        let good = format_locator(&id, FormulaType::Eval);
        assert!(parse_locator(&good).is_ok());

        let cases = [
            "not a url".to_string(),
            good.replacen("endo://", "http://", 1),
            format!("{good}&extra=1"),
            format!("endo://{}/?id={}", id.node(), id.number()),
            format!("endo://abc/?id={}&type=eval", id.number()),
            format!("endo://{}/?id=zz&type=eval", id.node()),
            format!("endo://{}/?id={}&type=lookup", id.node(), id.number()),
            format!("endo://{}:99/?id={}&type=eval", id.node(), id.number()),
            format!("{good}&id={}", id.number()),
        ];
        for case in cases {
            let err = parse_locator(&case).unwrap_err();
            assert_eq!(err.code(), "invalid_locator", "{case}");
        }
    }

    #[test]
    fn remote_sentinel_is_a_type() {
        let id = sample_id();
        let loc = parse_locator(&format_locator(&id, FormulaType::Remote)).unwrap();
        assert_eq!(loc.formula_type, FormulaType::Remote);
    }

    proptest! {
        #[test]
        fn format_then_parse_recovers_parts(
            node in "[0-9a-f]{128}",
            number in "[0-9a-f]{128}",
            idx in 0usize..FormulaType::ALL.len(),
        ) {
            let id = FormulaId::new(
                FormulaNumber::parse(&number).unwrap(),
                NodeId::parse(&node).unwrap(),
            );
            let ty = FormulaType::ALL[idx];
            let parsed = parse_locator(&format_locator(&id, ty)).unwrap();
            prop_assert_eq!(parsed.id, id);
            prop_assert_eq!(parsed.formula_type, ty);
        }
    }
}
