//! Modèle minimal des features échangées avec le moteur

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Emprise 3D d'une feature (`[minx, miny, minz]`, `[maxx, maxy, maxz]`)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub min: [f64; 3],
    pub max: [f64; 3],
}

impl Envelope {
    /// Construit depuis un `geographicalExtent` CityJSON (6 valeurs)
    pub fn from_extent(extent: &[f64]) -> Option<Self> {
        match extent {
            [minx, miny, minz, maxx, maxy, maxz] => Some(Self {
                min: [*minx, *miny, *minz],
                max: [*maxx, *maxy, *maxz],
            }),
            _ => None,
        }
    }
}

/// Valeur d'attribut générique
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeValue {
    Int(i64),
    Double(f64),
    Text(String),
}

/// Feature à importer
#[derive(Debug, Clone, PartialEq)]
pub struct CityFeature {
    /// Identifiant externe (gml:id / id CityJSON)
    pub objectid: Option<String>,
    /// Classe d'objet (Building, Road, ...)
    pub objectclass: String,
    /// Identifiant métier optionnel
    pub identifier: Option<String>,
    pub envelope: Option<Envelope>,
    pub attributes: BTreeMap<String, AttributeValue>,
    /// Représentation complète sérialisée
    pub content: serde_json::Value,
}

impl CityFeature {
    pub fn new(objectid: impl Into<String>, objectclass: impl Into<String>) -> Self {
        Self {
            objectid: Some(objectid.into()),
            objectclass: objectclass.into(),
            identifier: None,
            envelope: None,
            attributes: BTreeMap::new(),
            content: serde_json::Value::Null,
        }
    }

    /// Identifiant lisible pour les logs
    pub fn label(&self) -> &str {
        self.objectid.as_deref().unwrap_or("<no objectid>")
    }
}

/// Feature lue depuis la base pour export
#[derive(Debug, Clone, PartialEq)]
pub struct ExportedFeature {
    pub id: i64,
    pub objectid: Option<String>,
    pub objectclass: String,
    pub content: serde_json::Value,
}

/// Destination des features exportées
///
/// Appelée depuis plusieurs workers en parallèle.
pub trait FeatureSink: Send + Sync {
    fn write(&self, feature: ExportedFeature) -> Result<()>;
}

/// Filtre sur les classes d'objet (vide = tout accepter)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TypeFilter {
    classes: BTreeSet<String>,
}

impl TypeFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn new<I, S>(classes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            classes: classes.into_iter().map(Into::into).collect(),
        }
    }

    pub fn accepts(&self, objectclass: &str) -> bool {
        self.classes.is_empty() || self.classes.contains(objectclass)
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    pub fn classes(&self) -> impl Iterator<Item = &str> {
        self.classes.iter().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_from_extent() {
        let env = Envelope::from_extent(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
        assert_eq!(env.min, [1.0, 2.0, 3.0]);
        assert_eq!(env.max, [4.0, 5.0, 6.0]);
        assert!(Envelope::from_extent(&[1.0, 2.0]).is_none());
    }

    #[test]
    fn test_type_filter() {
        let all = TypeFilter::all();
        assert!(all.accepts("Building"));

        let buildings = TypeFilter::new(["Building", "BuildingPart"]);
        assert!(buildings.accepts("BuildingPart"));
        assert!(!buildings.accepts("Road"));
        assert_eq!(buildings.classes().count(), 2);
    }

    #[test]
    fn test_attribute_value_untagged() {
        let v: AttributeValue = serde_json::from_str("12").unwrap();
        assert_eq!(v, AttributeValue::Int(12));
        let v: AttributeValue = serde_json::from_str("12.5").unwrap();
        assert_eq!(v, AttributeValue::Double(12.5));
        let v: AttributeValue = serde_json::from_str("\"x\"").unwrap();
        assert_eq!(v, AttributeValue::Text("x".into()));
    }

    #[test]
    fn test_label() {
        let mut f = CityFeature::new("b1", "Building");
        assert_eq!(f.label(), "b1");
        f.objectid = None;
        assert_eq!(f.label(), "<no objectid>");
    }
}
