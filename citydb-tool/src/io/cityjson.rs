//! CityJSON Text Sequences (`.jsonl`)
//!
//! Première ligne: objet `CityJSON` (métadonnées, `transform`), puis une
//! ligne `CityJSONFeature` par feature. Les sommets sont des entiers
//! compressés par le `transform` de l'en-tête.

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Lines, Write};
use std::path::{Path, PathBuf};

use citydb_ops::{
    AttributeValue, CityFeature, Envelope, ExportedFeature, FeatureSink, OpsError, Result,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::{debug, warn};

/// Version écrite dans les en-têtes
pub const CITYJSON_VERSION: &str = "2.0";

/// Compression des sommets: `réel = entier * scale + translate`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Transform {
    pub scale: [f64; 3],
    pub translate: [f64; 3],
}

impl Transform {
    pub fn decode(&self, vertex: [f64; 3]) -> [f64; 3] {
        [
            vertex[0] * self.scale[0] + self.translate[0],
            vertex[1] * self.scale[1] + self.translate[1],
            vertex[2] * self.scale[2] + self.translate[2],
        ]
    }

    pub fn encode(&self, real: [f64; 3]) -> [i64; 3] {
        [
            ((real[0] - self.translate[0]) / self.scale[0]).round() as i64,
            ((real[1] - self.translate[1]) / self.scale[1]).round() as i64,
            ((real[2] - self.translate[2]) / self.scale[2]).round() as i64,
        ]
    }

    fn to_value(self) -> Value {
        json!({ "scale": self.scale, "translate": self.translate })
    }
}

#[derive(Debug, Deserialize)]
struct Header {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    version: Option<String>,
    #[serde(default)]
    transform: Option<Transform>,
}

fn vertex_of(value: &Value) -> Option<[f64; 3]> {
    match value.as_array()?.as_slice() {
        [x, y, z] => Some([x.as_f64()?, y.as_f64()?, z.as_f64()?]),
        _ => None,
    }
}

/// Emprise des sommets d'une feature (coordonnées réelles)
fn vertices_envelope(feature: &Value, transform: Option<&Transform>) -> Option<Envelope> {
    let mut min = [f64::INFINITY; 3];
    let mut max = [f64::NEG_INFINITY; 3];
    let mut any = false;
    for vertex in feature.get("vertices")?.as_array()?.iter().filter_map(vertex_of) {
        let real = transform.map_or(vertex, |t| t.decode(vertex));
        for axis in 0..3 {
            min[axis] = min[axis].min(real[axis]);
            max[axis] = max[axis].max(real[axis]);
        }
        any = true;
    }
    any.then_some(Envelope { min, max })
}

fn scalar_attributes(attributes: &Map<String, Value>) -> std::collections::BTreeMap<String, AttributeValue> {
    attributes
        .iter()
        .filter_map(|(name, value)| {
            let value = match value {
                Value::String(s) => AttributeValue::Text(s.clone()),
                Value::Bool(b) => AttributeValue::Text(b.to_string()),
                Value::Number(n) => match n.as_i64() {
                    Some(i) => AttributeValue::Int(i),
                    None => AttributeValue::Double(n.as_f64()?),
                },
                _ => return None,
            };
            Some((name.clone(), value))
        })
        .collect()
}

/// Lecteur paresseux de features
///
/// S'arrête après la première erreur.
pub struct CityJsonSeqReader {
    path: PathBuf,
    lines: Lines<BufReader<File>>,
    line_number: usize,
    transform: Option<Transform>,
    failed: bool,
}

impl CityJsonSeqReader {
    /// Ouvre un fichier et lit son en-tête
    ///
    /// # Errors
    /// `Reader` si le fichier est illisible ou si la première ligne n'est pas
    /// un objet `CityJSON`. Un fichier vide est accepté (aucune feature).
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)
            .map_err(|e| OpsError::Reader(format!("cannot open {}: {}", path.display(), e)))?;
        let mut reader = Self {
            path: path.to_path_buf(),
            lines: BufReader::new(file).lines(),
            line_number: 0,
            transform: None,
            failed: false,
        };
        reader.read_header()?;
        Ok(reader)
    }

    pub fn transform(&self) -> Option<&Transform> {
        self.transform.as_ref()
    }

    fn error(&self, message: impl std::fmt::Display) -> OpsError {
        OpsError::Reader(format!("{}:{}: {}", self.path.display(), self.line_number, message))
    }

    fn next_line(&mut self) -> Option<Result<String>> {
        loop {
            let line = self.lines.next()?;
            self.line_number += 1;
            match line {
                Ok(line) if line.trim().is_empty() => continue,
                Ok(line) => return Some(Ok(line)),
                Err(e) => return Some(Err(self.error(e))),
            }
        }
    }

    fn read_header(&mut self) -> Result<()> {
        let Some(line) = self.next_line() else {
            return Ok(());
        };
        let header: Header = serde_json::from_str(&line?)
            .map_err(|e| self.error(format!("invalid header: {}", e)))?;
        if header.kind != "CityJSON" {
            return Err(self.error(format!("expected a CityJSON header, found {}", header.kind)));
        }
        match header.version.as_deref() {
            Some(v) if v.starts_with("2.") || v.starts_with("1.1") => {}
            other => warn!(path = %self.path.display(), version = ?other, "Unexpected CityJSON version"),
        }
        self.transform = header.transform;
        debug!(path = %self.path.display(), transform = ?self.transform, "Read CityJSON header");
        Ok(())
    }

    fn parse_feature(&self, line: &str) -> Result<CityFeature> {
        let mut value: Value =
            serde_json::from_str(line).map_err(|e| self.error(format!("invalid JSON: {}", e)))?;

        let kind = value.get("type").and_then(Value::as_str).unwrap_or_default();
        if kind != "CityJSONFeature" {
            return Err(self.error(format!("expected a CityJSONFeature, found {}", kind)));
        }
        let id = value
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| self.error("feature without id"))?
            .to_string();
        let root = value
            .get("CityObjects")
            .and_then(|objects| objects.get(&id))
            .ok_or_else(|| self.error(format!("feature {} has no root city object", id)))?;

        let objectclass = root
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let attributes = root
            .get("attributes")
            .and_then(Value::as_object)
            .map(scalar_attributes)
            .unwrap_or_default();
        let identifier = match attributes.get("identifier") {
            Some(AttributeValue::Text(identifier)) => Some(identifier.clone()),
            _ => None,
        };
        let extent: Option<Vec<f64>> = root
            .get("geographicalExtent")
            .and_then(Value::as_array)
            .and_then(|values| values.iter().map(Value::as_f64).collect());
        let envelope = extent
            .as_deref()
            .and_then(Envelope::from_extent)
            .or_else(|| vertices_envelope(&value, self.transform.as_ref()));

        // Le contenu stocké porte son transform: il reste lisible seul
        if let (Some(transform), Some(object)) = (self.transform, value.as_object_mut()) {
            object.insert("transform".to_string(), transform.to_value());
        }

        Ok(CityFeature {
            objectid: Some(id),
            objectclass,
            identifier,
            envelope,
            attributes,
            content: value,
        })
    }
}

impl Iterator for CityJsonSeqReader {
    type Item = Result<CityFeature>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        let result = match self.next_line()? {
            Ok(line) => self.parse_feature(&line),
            Err(e) => Err(e),
        };
        if result.is_err() {
            self.failed = true;
        }
        Some(result)
    }
}

fn sink_error(path: &Path, e: impl std::fmt::Display) -> OpsError {
    OpsError::Sink(format!("{}: {}", path.display(), e))
}

/// Feature complète à écrire (contenu stocké ou feature minimale)
fn feature_value(feature: ExportedFeature) -> Value {
    let objectid = feature
        .objectid
        .unwrap_or_else(|| format!("feature-{}", feature.id));
    match feature.content {
        Value::Object(mut object) => {
            object
                .entry("type")
                .or_insert_with(|| Value::String("CityJSONFeature".into()));
            object.entry("id").or_insert_with(|| Value::String(objectid));
            Value::Object(object)
        }
        _ => json!({
            "type": "CityJSONFeature",
            "id": objectid,
            "CityObjects": { objectid.as_str(): { "type": feature.objectclass } },
            "vertices": [],
        }),
    }
}

fn take_transform(feature: &mut Value) -> Option<Transform> {
    let value = feature.as_object_mut()?.remove("transform")?;
    serde_json::from_value(value).ok()
}

/// Réexprime les sommets de `from` vers `to`
///
/// Sans transform cible, les sommets sont écrits en coordonnées réelles.
fn rebase_vertices(feature: &mut Value, from: Option<&Transform>, to: Option<&Transform>) {
    if from == to {
        return;
    }
    let Some(vertices) = feature.get_mut("vertices").and_then(Value::as_array_mut) else {
        return;
    };
    for vertex in vertices.iter_mut() {
        let Some(raw) = vertex_of(vertex) else {
            continue;
        };
        let real = from.map_or(raw, |t| t.decode(raw));
        *vertex = match to {
            Some(t) => json!(t.encode(real)),
            None => json!(real),
        };
    }
}

struct WriterState {
    out: BufWriter<File>,
    /// Transform de l'en-tête, fixé par la première feature
    header: Option<Option<Transform>>,
    written: u64,
}

/// Destination d'export CityJSON Sequence
///
/// L'en-tête reprend le transform de la première feature écrite; les
/// features suivantes sont ramenées sur ce transform.
pub struct CityJsonSeqWriter {
    path: PathBuf,
    state: Mutex<WriterState>,
}

impl CityJsonSeqWriter {
    pub fn create(path: &Path) -> Result<Self> {
        let file = File::create(path).map_err(|e| sink_error(path, e))?;
        Ok(Self {
            path: path.to_path_buf(),
            state: Mutex::new(WriterState {
                out: BufWriter::new(file),
                header: None,
                written: 0,
            }),
        })
    }

    pub fn written(&self) -> u64 {
        self.state.lock().written
    }

    fn write_header(&self, out: &mut BufWriter<File>, transform: Option<Transform>) -> Result<()> {
        let mut header = json!({
            "type": "CityJSON",
            "version": CITYJSON_VERSION,
            "CityObjects": {},
            "vertices": [],
        });
        if let (Some(transform), Some(object)) = (transform, header.as_object_mut()) {
            object.insert("transform".to_string(), transform.to_value());
        }
        serde_json::to_writer(&mut *out, &header).map_err(|e| sink_error(&self.path, e))?;
        out.write_all(b"\n").map_err(|e| sink_error(&self.path, e))
    }

    /// Écrit l'en-tête si aucune feature n'a été écrite et vide le tampon
    pub fn finish(&self) -> Result<u64> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if state.header.is_none() {
            self.write_header(&mut state.out, None)?;
            state.header = Some(None);
        }
        state.out.flush().map_err(|e| sink_error(&self.path, e))?;
        Ok(state.written)
    }
}

impl FeatureSink for CityJsonSeqWriter {
    fn write(&self, feature: ExportedFeature) -> Result<()> {
        let mut value = feature_value(feature);
        let transform = take_transform(&mut value);

        let mut guard = self.state.lock();
        let state = &mut *guard;
        let header = match state.header {
            Some(header) => header,
            None => {
                self.write_header(&mut state.out, transform)?;
                state.header = Some(transform);
                transform
            }
        };
        rebase_vertices(&mut value, transform.as_ref(), header.as_ref());

        serde_json::to_writer(&mut state.out, &value).map_err(|e| sink_error(&self.path, e))?;
        state
            .out
            .write_all(b"\n")
            .map_err(|e| sink_error(&self.path, e))?;
        state.written += 1;
        Ok(())
    }
}
