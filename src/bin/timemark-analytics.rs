/*
 *  Copyright (C) 2025 Michael Bachmann
 *
 *  This program is free software: you can redistribute it and/or modify
 *  it under the terms of the GNU Affero General Public License as published by
 *  the Free Software Foundation, either version 3 of the License, or
 *  (at your option) any later version.
 *
 *  This program is distributed in the hope that it will be useful,
 *  but WITHOUT ANY WARRANTY; without even the implied warranty of
 *  MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 *  GNU Affero General Public License for more details.
 *
 *  You should have received a copy of the GNU Affero General Public License
 *  along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

use miette::{Result, miette};
use std::time::Duration;
use timemark::{analytics::run_analytics, config::Config, error::TimemarkError};
use tokio_graceful_shutdown::{SubsystemBuilder, Toplevel};
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    timemark::init_tracing()?;
    let config = Config::load().await?;

    let analytics_config = config
        .analytics
        .clone()
        .ok_or_else(|| miette!("config has no analytics section"))?;
    let service = "analytics".to_owned();

    info!("Starting {} ({})", service, config.instance_name());

    Toplevel::new(move |s| async move {
        s.start(SubsystemBuilder::new("analytics", move |s| async move {
            run_analytics(s, analytics_config, service).await?;
            Ok::<(), TimemarkError>(())
        }));
    })
    .catch_signals()
    .handle_shutdown_requests(Duration::from_secs(5))
    .await?;

    Ok(())
}
