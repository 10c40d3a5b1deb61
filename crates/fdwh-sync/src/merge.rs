use serde::Serialize;

use crate::warehouse::quote_qualified;
use crate::{OrphanPolicy, TableNames};

/// Measures copied verbatim from the staging fact into the gold fact.
pub const FACT_MEASURES: &[&str] = &[
    "suppression_units",
    "suppression_personnel",
    "ems_units",
    "ems_personnel",
    "other_units",
    "other_personnel",
    "estimated_property_loss",
    "estimated_contents_loss",
    "fire_fatalities",
    "fire_injuries",
    "civilian_fatalities",
    "civilian_injuries",
];

/// Insert-missing-rows statements that move staging data into the star schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStatement {
    DimBattalion,
    DimDistrict,
    FactInjuries,
}

impl MergeStatement {
    /// Dimensions first so the fact join can resolve surrogate keys.
    pub const ORDERED: [MergeStatement; 3] = [
        MergeStatement::DimBattalion,
        MergeStatement::DimDistrict,
        MergeStatement::FactInjuries,
    ];

    pub fn name(self) -> &'static str {
        match self {
            MergeStatement::DimBattalion => "dim_battalion",
            MergeStatement::DimDistrict => "dim_district",
            MergeStatement::FactInjuries => "fact_fire_department_injuries",
        }
    }

    pub fn target(self, tables: &TableNames) -> &str {
        match self {
            MergeStatement::DimBattalion => &tables.dim_battalion,
            MergeStatement::DimDistrict => &tables.dim_district,
            MergeStatement::FactInjuries => &tables.fact,
        }
    }

    pub fn source(self, tables: &TableNames) -> &str {
        match self {
            MergeStatement::DimBattalion => &tables.stg_battalion,
            MergeStatement::DimDistrict => &tables.stg_district,
            MergeStatement::FactInjuries => &tables.stg_fact,
        }
    }

    pub fn sql(self, tables: &TableNames, orphans: OrphanPolicy) -> String {
        let target = quote_qualified(self.target(tables));
        let source = quote_qualified(self.source(tables));
        match self {
            MergeStatement::DimBattalion => format!(
                "INSERT INTO {target} (battalion) \
                 SELECT battalion FROM {source} \
                 WHERE battalion IS NOT NULL \
                 ON CONFLICT (battalion) DO NOTHING"
            ),
            MergeStatement::DimDistrict => format!(
                "INSERT INTO {target} (neighborhood_district, city, city_cleaned) \
                 SELECT neighborhood_district, city, city_cleaned FROM {source} \
                 WHERE neighborhood_district IS NOT NULL \
                 ON CONFLICT (neighborhood_district) DO NOTHING"
            ),
            MergeStatement::FactInjuries => {
                let join = match orphans {
                    OrphanPolicy::Permit => "LEFT JOIN",
                    OrphanPolicy::Reject => "INNER JOIN",
                };
                let dim_battalion = quote_qualified(&tables.dim_battalion);
                let dim_district = quote_qualified(&tables.dim_district);
                let measures = FACT_MEASURES.join(", ");
                let selected = FACT_MEASURES
                    .iter()
                    .map(|m| format!("fact.{m}"))
                    .collect::<Vec<_>>()
                    .join(", ");
                format!(
                    "INSERT INTO {target} (incident_number, id, incident_date, dim_battalion_sk, \
                     dim_district_sk, {measures}, num_alarms) \
                     SELECT fact.incident_number, fact.id, fact.incident_date, \
                     battalion.dim_battalion_sk, district.dim_district_sk, {selected}, \
                     fact.number_of_alarms \
                     FROM {source} fact \
                     {join} {dim_battalion} battalion ON fact.battalion = battalion.battalion \
                     {join} {dim_district} district \
                     ON fact.neighborhood_district = district.neighborhood_district \
                     ON CONFLICT (id) DO NOTHING"
                )
            }
        }
    }
}
