// crates/keel-daemon/src/genesis.rs
//
// Seeds the simulated chain with one sequencer layer, a staker and a bridge
// deposit so issuance and distribution have something to act on.

use tracing::info;

use keel_core::error::KeelError;
use keel_core::traits::TokenLedger;
use keel_core::{Address, LayerKind};
use keel_economics::registry::SequencerIdentity;
use keel_protocol::{registry_vault, StakingContext};

use crate::config::GenesisConfig;

pub fn genesis_identity() -> SequencerIdentity {
    SequencerIdentity {
        name: "genesis".to_string(),
        address_manager: Address::from_label("genesis/address-manager"),
        l1_bridge: Address::from_label("genesis/l1-bridge"),
        l2_bridge: Address::from_label("genesis/l2-bridge"),
        l2_token: Address::from_label("genesis/l2-token"),
    }
}

pub fn seed(cx: &mut StakingContext, genesis: &GenesisConfig) -> Result<(), KeelError> {
    if genesis.sequencer_deposit == 0 {
        info!("no genesis layer configured");
        return Ok(());
    }

    let sequencer = Address::from_label("genesis/sequencer");
    let identity = genesis_identity();
    cx.attestation_mut()
        .attest(identity.address_manager, sequencer);
    let token = cx.token_mut();
    token.mint(&sequencer, genesis.sequencer_deposit)?;
    token.approve(&sequencer, &registry_vault(), genesis.sequencer_deposit);
    let layer = cx.create_sequencer(&sequencer, identity, genesis.sequencer_deposit)?;

    if genesis.staker_principal > 0 {
        let staker = Address::from_label("genesis/staker");
        cx.token_mut().mint(&staker, genesis.staker_principal)?;
        cx.pull_and_stake(LayerKind::Sequencer, layer.index, &staker, genesis.staker_principal)?;
    }
    if genesis.bridge_deposit > 0 {
        let depositor = Address::from_label("genesis/depositor");
        cx.token_mut().mint(&depositor, genesis.bridge_deposit)?;
        cx.bridge_deposit(layer.index, &depositor, genesis.bridge_deposit)?;
    }

    info!(
        layer = layer.index,
        deposit = genesis.sequencer_deposit,
        staked = genesis.staker_principal,
        bridged = genesis.bridge_deposit,
        "genesis seeded"
    );
    Ok(())
}
