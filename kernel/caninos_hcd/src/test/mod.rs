//! A controller wired to fake hardware, for driving whole transfers.

pub mod fake;

use alloc::sync::Arc;
use usb_hcd::{DeviceInfo, HostControllerOps, HubRequest, PortFeature, Speed};
use crate::{
    config::HcdConfig,
    dma::DmaAllocator,
    hcd::CaninosHcd,
    regs::{bits, otg_state, HardwareProfile, RegisterMap},
    Platform,
};
use fake::{FakeDma, FakePlatform, FakeRegs, RecordingHost};

pub struct Fixture {
    pub map: &'static RegisterMap,
    pub regs: Arc<FakeRegs>,
    pub dma: Arc<FakeDma>,
    pub platform: Arc<FakePlatform>,
    pub host: Arc<RecordingHost>,
    pub hcd: Arc<CaninosHcd<Arc<FakeRegs>>>,
}

impl Fixture {
    /// A controller that has not been attached yet.
    pub fn new(config: HcdConfig) -> Self {
        let map = HardwareProfile::K5.registers();
        let regs = Arc::new(FakeRegs::new(map));
        let dma = Arc::new(FakeDma::new());
        let platform = Arc::new(FakePlatform::new());
        let host = Arc::new(RecordingHost::new());
        // the PHY calibrates instantly
        regs.stick(map.phy_ctrl, bits::PHY_CAL_DONE);
        let hcd = CaninosHcd::new(
            0,
            HardwareProfile::K5,
            config,
            regs.clone(),
            dma.clone() as Arc<dyn DmaAllocator>,
            host.clone(),
            platform.clone() as Arc<dyn Platform>,
        )
        .unwrap();
        Fixture { map, regs, dma, platform, host, hcd: Arc::new(hcd) }
    }

    pub fn attached() -> Self {
        Self::attached_with(HcdConfig::default())
    }

    /// A controller with a high-speed device on its enabled port.
    pub fn attached_with(config: HcdConfig) -> Self {
        let f = Self::new(config);
        f.regs.poke8(f.map.otgstate, otg_state::A_HOST);
        f.hcd.attach().unwrap();
        f.hcd.start().unwrap();
        f.hub(HubRequest::SetPortFeature { port: 1, feature: PortFeature::Power });
        f.hub(HubRequest::SetPortFeature { port: 1, feature: PortFeature::Reset });
        f.regs.poke8(f.map.usbcs, bits::USBCS_HSMODE);
        f.irq(f.map.vectors.usb_reset);
        f.hub(HubRequest::ClearPortFeature { port: 1, feature: PortFeature::CConnection });
        f.hub(HubRequest::ClearPortFeature { port: 1, feature: PortFeature::CReset });
        f
    }

    pub fn hub(&self, req: HubRequest) {
        self.hcd.hub_control(req).unwrap();
    }

    /// Latches `vector` in IVECT and raises the summary interrupt.
    pub fn raise_vector(&self, vector: u8) {
        self.regs.poke8(self.map.ivect, vector);
        self.regs.raise8(self.map.usbeirq, bits::USBEIRQ_USBIRQ);
    }

    pub fn irq(&self, vector: u8) -> bool {
        self.raise_vector(vector);
        self.hcd.handle_irq()
    }

    pub fn device(speed: Speed) -> DeviceInfo {
        DeviceInfo { address: 2, speed, port: 1, tt: None }
    }
}
