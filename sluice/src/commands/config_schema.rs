use anyhow::Result;
use schemars::schema_for;
use sluice_common::SluiceConfigStore;

pub(crate) fn command() -> Result<()> {
    let schema = schema_for!(SluiceConfigStore);
    println!("{}", serde_json::to_string_pretty(&schema)?);
    Ok(())
}
