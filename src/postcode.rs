use std::collections::{HashMap, HashSet};
use std::path::Path;

use geo::{BoundingRect, Contains, Intersects, Polygon, Rect};
use geojson::{FeatureCollection, GeoJson};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::buildings::BuildingRecord;
use crate::error::{Result, StockError};

/// One identifier-join row: a unique property reference mapped to the
/// postcode it belongs to, with its surveyed grid position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnitLink {
    #[serde(rename = "UPRN")]
    pub uprn: String,
    #[serde(rename = "PCDS")]
    pub postcode: String,
    #[serde(rename = "GRIDGB1E")]
    pub easting: Option<f64>,
    #[serde(rename = "GRIDGB1N")]
    pub northing: Option<f64>,
}

/// Identifier-join table for one batch, grouped by postcode.
pub struct UnitIndex {
    by_postcode: HashMap<String, Vec<UnitLink>>,
}

impl UnitIndex {
    pub fn from_path(path: &Path) -> Result<Self> {
        let mut rdr = csv::Reader::from_path(path)?;
        let mut by_postcode: HashMap<String, Vec<UnitLink>> = HashMap::new();
        let mut rows = 0usize;
        for result in rdr.deserialize::<UnitLink>() {
            let link = result?;
            rows += 1;
            by_postcode
                .entry(link.postcode.trim().to_owned())
                .or_default()
                .push(link);
        }
        debug!(rows, postcodes = by_postcode.len(), "loaded identifier join table");
        Ok(Self { by_postcode })
    }

    pub fn from_links(links: Vec<UnitLink>) -> Self {
        let mut by_postcode: HashMap<String, Vec<UnitLink>> = HashMap::new();
        for link in links {
            by_postcode
                .entry(link.postcode.trim().to_owned())
                .or_default()
                .push(link);
        }
        Self { by_postcode }
    }

    pub fn get(&self, postcode: &str) -> Option<&[UnitLink]> {
        self.by_postcode.get(postcode.trim()).map(|v| v.as_slice())
    }

    pub fn len(&self) -> usize {
        self.by_postcode.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_postcode.is_empty()
    }
}

/// A postcode with its boundary polygon. Read-only for the lifetime of a
/// batch.
#[derive(Debug, Clone)]
pub struct GeographicUnit {
    pub code: String,
    pub boundary: Polygon<f64>,
}

/// Boundary polygons for the postcodes of a batch, keyed by code.
pub struct UnitBoundaries {
    map: HashMap<String, GeographicUnit>,
}

impl UnitBoundaries {
    pub fn from_path(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_str(&text)
    }

    pub fn from_str(text: &str) -> Result<Self> {
        let geojson: GeoJson = text.parse()?;
        let collection = FeatureCollection::try_from(geojson)?;
        let mut map = HashMap::new();
        for feature in collection.features {
            let code = feature
                .properties
                .as_ref()
                .and_then(|props| prop_string(props, "POSTCODE"))
                .ok_or_else(|| StockError::MissingColumn("POSTCODE".to_owned()))?;
            let boundary = feature_polygon(&feature, &code)?;
            map.insert(
                code.trim().to_owned(),
                GeographicUnit {
                    code: code.trim().to_owned(),
                    boundary,
                },
            );
        }
        Ok(Self { map })
    }

    pub fn get(&self, postcode: &str) -> Option<&GeographicUnit> {
        self.map.get(postcode.trim())
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }
}

/// Anything that can hand back building records for a bounding box. The
/// production store is GeoJSON-backed; tests substitute in-memory fixtures.
pub trait BuildingSource {
    fn query_bbox(&self, bbox: &Rect<f64>) -> Result<Vec<BuildingRecord>>;
}

/// File-backed building store: the survey's footprint collection, loaded
/// once, served by bounding-box overlap.
pub struct GeoJsonBuildings {
    records: Vec<(Rect<f64>, BuildingRecord)>,
}

impl GeoJsonBuildings {
    pub fn from_path(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_str(&text)
    }

    pub fn from_str(text: &str) -> Result<Self> {
        let geojson: GeoJson = text.parse()?;
        let collection = FeatureCollection::try_from(geojson)?;
        let mut records = Vec::new();
        for feature in collection.features {
            let props = match feature.properties.as_ref() {
                Some(props) => props,
                None => return Err(StockError::MissingColumn("upn".to_owned())),
            };
            let upn = prop_string(props, "upn")
                .ok_or_else(|| StockError::MissingColumn("upn".to_owned()))?;
            let footprint = feature_polygon(&feature, &upn)?;
            let bbox = footprint
                .bounding_rect()
                .ok_or_else(|| StockError::BadGeometry(upn.clone()))?;
            let record = BuildingRecord {
                upn,
                premise_area: prop_f64(props, "premise_area"),
                height: prop_string(props, "height"),
                floor_count: prop_string(props, "premise_floor_count"),
                use_type: prop_string(props, "map_simple_use"),
                premise_type: prop_string(props, "premise_type"),
                premise_age: prop_string(props, "premise_age"),
                listed_grade: prop_string(props, "listed_grade"),
                basement: prop_string(props, "basement"),
                uprn_count: prop_f64(props, "uprn_count"),
                footprint,
            };
            records.push((bbox, record));
        }
        Ok(Self { records })
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }
}

impl BuildingSource for GeoJsonBuildings {
    fn query_bbox(&self, bbox: &Rect<f64>) -> Result<Vec<BuildingRecord>> {
        Ok(self
            .records
            .iter()
            .filter(|(rect, _)| rect.intersects(bbox))
            .map(|(_, record)| record.clone())
            .collect())
    }
}

fn feature_polygon(feature: &geojson::Feature, label: &str) -> Result<Polygon<f64>> {
    let geometry = feature
        .geometry
        .as_ref()
        .ok_or_else(|| StockError::BadGeometry(label.to_owned()))?;
    Polygon::try_from(geometry.value.clone())
        .map_err(|_| StockError::BadGeometry(label.to_owned()))
}

fn prop_string(props: &geojson::JsonObject, key: &str) -> Option<String> {
    match props.get(key) {
        Some(geojson::JsonValue::String(s)) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_owned())
            }
        }
        Some(geojson::JsonValue::Number(n)) => Some(n.to_string()),
        _ => None,
    }
}

fn prop_f64(props: &geojson::JsonObject, key: &str) -> Option<f64> {
    props.get(key).and_then(|v| v.as_f64())
}

static LEADING_LETTERS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^([A-Za-z]{1,2})\d").expect("postcode area pattern"));

/// Outcode letters of a postcode ("SW1A 1AA" -> "SW"). None for strings
/// that do not look like postcodes.
pub fn leading_letters(postcode: &str) -> Option<String> {
    LEADING_LETTERS
        .captures(postcode.trim())
        .map(|caps| caps[1].to_owned())
}

/// Every building belonging to a postcode: identifier matches unioned with
/// footprints lying within the unit boundary, deduplicated by building key.
/// Survey identifiers go stale; the containment fallback recovers buildings
/// whose placement is right even when their identifier linkage is broken.
/// A postcode with no identifier-join rows is an empty result, not an
/// error.
pub fn match_unit_buildings(
    postcode: &str,
    index: &UnitIndex,
    boundaries: &UnitBoundaries,
    source: &dyn BuildingSource,
) -> Result<Vec<BuildingRecord>> {
    let postcode = postcode.trim();
    let links = match index.get(postcode) {
        Some(links) if !links.is_empty() => links,
        _ => {
            debug!(postcode, "no identifier-join rows for unit");
            return Ok(Vec::new());
        }
    };
    let unit = boundaries.get(postcode);

    let mut corners: Vec<(f64, f64)> = links
        .iter()
        .filter_map(|link| match (link.easting, link.northing) {
            (Some(e), Some(n)) => Some((e, n)),
            _ => None,
        })
        .collect();
    if let Some(unit) = unit {
        if let Some(rect) = unit.boundary.bounding_rect() {
            corners.push((rect.min().x, rect.min().y));
            corners.push((rect.max().x, rect.max().y));
        }
    }
    if corners.is_empty() {
        warn!(postcode, "no coordinates available to query the building store");
        return Ok(Vec::new());
    }
    let min_x = corners.iter().map(|c| c.0).fold(f64::INFINITY, f64::min);
    let min_y = corners.iter().map(|c| c.1).fold(f64::INFINITY, f64::min);
    let max_x = corners.iter().map(|c| c.0).fold(f64::NEG_INFINITY, f64::max);
    let max_y = corners.iter().map(|c| c.1).fold(f64::NEG_INFINITY, f64::max);
    let bbox = Rect::new((min_x, min_y), (max_x, max_y));

    let candidates = source.query_bbox(&bbox)?;
    let uprns: HashSet<&str> = links.iter().map(|link| link.uprn.as_str()).collect();

    let mut seen: HashSet<String> = HashSet::new();
    let mut matched = Vec::new();
    for candidate in candidates {
        let by_identifier = uprns.contains(candidate.upn.as_str());
        let by_containment = unit
            .map(|u| u.boundary.contains(&candidate.footprint))
            .unwrap_or(false);
        if by_identifier || by_containment {
            if !seen.insert(candidate.upn.clone()) {
                return Err(StockError::DuplicateKey(candidate.upn));
            }
            matched.push(candidate);
        }
    }
    debug!(postcode, matched = matched.len(), "matched unit buildings");
    Ok(matched)
}

#[cfg(test)]
mod tests {
    use super::*;
    use geo::{LineString, Polygon};

    fn square_at(x: f64, y: f64, side: f64) -> Polygon<f64> {
        Polygon::new(
            LineString::from(vec![
                (x, y),
                (x + side, y),
                (x + side, y + side),
                (x, y + side),
            ]),
            vec![],
        )
    }

    fn stored(upn: &str, x: f64, y: f64) -> BuildingRecord {
        crate::buildings::tests::building(upn, square_at(x, y, 5.0))
    }

    struct FixtureSource(Vec<BuildingRecord>);

    impl BuildingSource for FixtureSource {
        fn query_bbox(&self, bbox: &Rect<f64>) -> Result<Vec<BuildingRecord>> {
            Ok(self
                .0
                .iter()
                .filter(|r| r.footprint.bounding_rect().unwrap().intersects(bbox))
                .cloned()
                .collect())
        }
    }

    fn link(uprn: &str, postcode: &str, e: f64, n: f64) -> UnitLink {
        UnitLink {
            uprn: uprn.to_owned(),
            postcode: postcode.to_owned(),
            easting: Some(e),
            northing: Some(n),
        }
    }

    fn boundaries_for(code: &str, boundary: Polygon<f64>) -> UnitBoundaries {
        let mut map = HashMap::new();
        map.insert(
            code.to_owned(),
            GeographicUnit {
                code: code.to_owned(),
                boundary,
            },
        );
        UnitBoundaries { map }
    }

    #[test]
    fn identifier_join_matches_buildings() {
        let source = FixtureSource(vec![stored("b1", 0.0, 0.0), stored("b2", 50.0, 50.0)]);
        let index = UnitIndex::from_links(vec![link("b1", "AB1 2CD", 2.0, 2.0)]);
        let boundaries = boundaries_for("AB1 2CD", square_at(0.0, 0.0, 10.0));

        let matched = match_unit_buildings("AB1 2CD", &index, &boundaries, &source).unwrap();
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].upn, "b1");
    }

    #[test]
    fn containment_fallback_recovers_unlinked_buildings() {
        // b2 sits inside the boundary but its identifier is absent from the
        // join table
        let source = FixtureSource(vec![stored("b1", 1.0, 1.0), stored("b2", 10.0, 10.0)]);
        let index = UnitIndex::from_links(vec![link("b1", "AB1 2CD", 2.0, 2.0)]);
        let boundaries = boundaries_for("AB1 2CD", square_at(0.0, 0.0, 20.0));

        let matched = match_unit_buildings("AB1 2CD", &index, &boundaries, &source).unwrap();
        let keys: Vec<&str> = matched.iter().map(|r| r.upn.as_str()).collect();
        assert_eq!(keys, vec!["b1", "b2"]);
    }

    #[test]
    fn double_matches_are_deduplicated() {
        // b1 matches by identifier and lies within the boundary; it must
        // appear once
        let source = FixtureSource(vec![stored("b1", 1.0, 1.0)]);
        let index = UnitIndex::from_links(vec![link("b1", "AB1 2CD", 2.0, 2.0)]);
        let boundaries = boundaries_for("AB1 2CD", square_at(0.0, 0.0, 20.0));

        let matched = match_unit_buildings("AB1 2CD", &index, &boundaries, &source).unwrap();
        assert_eq!(matched.len(), 1);
    }

    #[test]
    fn unknown_postcode_yields_empty_result() {
        let source = FixtureSource(vec![stored("b1", 1.0, 1.0)]);
        let index = UnitIndex::from_links(vec![]);
        let boundaries = boundaries_for("AB1 2CD", square_at(0.0, 0.0, 20.0));

        let matched = match_unit_buildings("ZZ9 9ZZ", &index, &boundaries, &source).unwrap();
        assert!(matched.is_empty());
    }

    #[test]
    fn duplicate_building_keys_are_fatal() {
        let source = FixtureSource(vec![stored("b1", 1.0, 1.0), stored("b1", 3.0, 3.0)]);
        let index = UnitIndex::from_links(vec![link("b1", "AB1 2CD", 2.0, 2.0)]);
        let boundaries = boundaries_for("AB1 2CD", square_at(0.0, 0.0, 20.0));

        let err = match_unit_buildings("AB1 2CD", &index, &boundaries, &source).unwrap_err();
        assert!(matches!(err, StockError::DuplicateKey(k) if k == "b1"));
    }

    #[test]
    fn geojson_store_parses_footprints_and_properties() {
        let text = r#"{
            "type": "FeatureCollection",
            "features": [{
                "type": "Feature",
                "geometry": {
                    "type": "Polygon",
                    "coordinates": [[[0,0],[10,0],[10,5],[0,5],[0,0]]]
                },
                "properties": {
                    "upn": "b1",
                    "premise_area": 48.5,
                    "height": 6.1,
                    "premise_floor_count": "2",
                    "map_simple_use": "Residential",
                    "premise_type": "Standard size detached",
                    "premise_age": "1870-1918",
                    "listed_grade": null,
                    "basement": "No basement",
                    "uprn_count": 1
                }
            }]
        }"#;
        let store = GeoJsonBuildings::from_str(text).unwrap();
        assert_eq!(store.len(), 1);
        let hits = store
            .query_bbox(&Rect::new((1.0, 1.0), (2.0, 2.0)))
            .unwrap();
        assert_eq!(hits.len(), 1);
        let b = &hits[0];
        assert_eq!(b.upn, "b1");
        assert_eq!(b.premise_area, Some(48.5));
        assert_eq!(b.height.as_deref(), Some("6.1"));
        assert_eq!(b.listed_grade, None);

        let misses = store
            .query_bbox(&Rect::new((100.0, 100.0), (110.0, 110.0)))
            .unwrap();
        assert!(misses.is_empty());
    }

    #[test]
    fn boundary_collection_parses_postcode_property() {
        let text = r#"{
            "type": "FeatureCollection",
            "features": [{
                "type": "Feature",
                "geometry": {
                    "type": "Polygon",
                    "coordinates": [[[0,0],[20,0],[20,20],[0,20],[0,0]]]
                },
                "properties": { "POSTCODE": "AB1 2CD" }
            }]
        }"#;
        let boundaries = UnitBoundaries::from_str(text).unwrap();
        assert!(boundaries.get("AB1 2CD").is_some());
        assert!(boundaries.get("ZZ9 9ZZ").is_none());
    }

    #[test]
    fn leading_letters_extracts_outcode_area() {
        assert_eq!(leading_letters("SW1A 1AA").as_deref(), Some("SW"));
        assert_eq!(leading_letters("E2 7AD").as_deref(), Some("E"));
        assert_eq!(leading_letters(" m1 1AE ").as_deref(), Some("m"));
        assert_eq!(leading_letters("123"), None);
        assert_eq!(leading_letters(""), None);
    }
}
