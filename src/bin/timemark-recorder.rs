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
use timemark::{config::Config, error::TimemarkError, recorder::run_recorder};
use tokio_graceful_shutdown::{SubsystemBuilder, Toplevel};
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    timemark::init_tracing()?;
    let config = Config::load().await?;

    let recorder_config = config
        .recorder
        .clone()
        .ok_or_else(|| miette!("config has no recorder section"))?;
    let service = "core-recorder".to_owned();
    let hostname = config.app.instance.name.clone();

    info!("Starting {} ({})", service, config.instance_name());

    Toplevel::new(move |s| async move {
        s.start(SubsystemBuilder::new("recorder", move |s| async move {
            run_recorder(s, recorder_config, service, hostname).await?;
            Ok::<(), TimemarkError>(())
        }));
    })
    .catch_signals()
    .handle_shutdown_requests(Duration::from_secs(5))
    .await?;

    Ok(())
}
