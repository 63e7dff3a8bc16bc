use axum::extract::{Path, Query, State};
use axum::response::Html;
use axum::Json;
use serde::Deserialize;

use velo_consensus::Cluster;
use velo_storage::BikeStore;
use velo_types::Bike;

use crate::{ApiError, AppState};

#[derive(Debug, Deserialize)]
pub struct PageParams {
    pub limit: u64,
    pub offset: u64,
}

/// GET /bikes — read page, newest first. Both parameters are required;
/// missing or non-integer values reject with 400 before this runs.
pub async fn get_bikes<C: Cluster, B: BikeStore>(
    State(app): State<AppState<C, B>>,
    Query(page): Query<PageParams>,
) -> Result<Json<Vec<Bike>>, ApiError> {
    let bikes = app.bikes.get_bikes(page.limit, page.offset).await?;
    Ok(Json(bikes))
}

/// GET /bikes/{id} — read one. Unparseable ids reject with 400; a missing
/// bike is 404.
pub async fn get_bike<C: Cluster, B: BikeStore>(
    State(app): State<AppState<C, B>>,
    Path(id): Path<u64>,
) -> Result<Json<Bike>, ApiError> {
    let bike = app.bikes.get_bike(id).await?;
    Ok(Json(bike))
}

fn default_limit() -> u64 {
    50
}

#[derive(Debug, Deserialize)]
pub struct IndexParams {
    #[serde(default = "default_limit")]
    pub limit: u64,
    #[serde(default)]
    pub offset: u64,
}

/// GET / — browser index page: one page of the catalog and a next link.
pub async fn index<C: Cluster, B: BikeStore>(
    State(app): State<AppState<C, B>>,
    Query(page): Query<IndexParams>,
) -> Result<Html<String>, ApiError> {
    let bikes = app.bikes.get_bikes(page.limit, page.offset).await?;

    let mut body = String::from(
        "<!doctype html>\n<html>\n<head><title>velodrome</title></head>\n<body>\n<h1>Bikes</h1>\n<ul>\n",
    );
    for bike in &bikes {
        let components: Vec<&str> =
            bike.components.iter().map(|c| c.name.as_str()).collect();
        body.push_str(&format!(
            "<li><a href=\"/bikes/{}\">#{} {}</a> ({})</li>\n",
            bike.id,
            bike.id,
            html_escape(&bike.name),
            html_escape(&components.join(", ")),
        ));
    }
    body.push_str(&format!(
        "</ul>\n<a href=\"/?limit={}&offset={}\">next</a>\n</body>\n</html>\n",
        page.limit,
        page.offset + page.limit,
    ));
    Ok(Html(body))
}

fn html_escape(s: &str) -> String {
    s.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}
