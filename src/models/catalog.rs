/// Master data for one catalog seeding run.
///
/// Rows are inserted parent-first: measure types, buildings, locations, tags.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CatalogSeed {
    pub measure_types: Vec<MeasureTypeRow>,
    pub buildings: Vec<BuildingRow>,
    pub locations: Vec<LocationRow>,
    pub tags: Vec<TagRow>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MeasureTypeRow {
    pub measure_type_id: i64,
    pub measure_type_name: String,
    pub unit: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BuildingRow {
    pub building_id: i64,
    pub building_name: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LocationRow {
    pub location_id: i64,
    pub building_id: i64,
    pub location_name: String,
    pub floor: Option<String>,
    pub is_active: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TagRow {
    pub tag_id: i64,
    pub building_id: i64,
    pub location_id: i64,
    pub measure_type_id: i64,
    pub tag_code: String,
    pub min_value: Option<f64>,
    pub max_value: Option<f64>,
}
