use detect_types::Finding;
use image::Rgb;

/// A canned detection drawn onto every frame until a real model is wired in.
pub struct SimulatedFinding {
    pub bbox: [i32; 4],
    pub label: &'static str,
    pub color: Rgb<u8>,
    pub confidence: f32,
    pub description: &'static str,
}

pub const SIMULATED_FINDINGS: [SimulatedFinding; 3] = [
    SimulatedFinding {
        bbox: [50, 50, 150, 180],
        label: "attentive",
        color: Rgb([0, 128, 0]),
        confidence: 0.92,
        description: "Student appears focused and engaged with the lesson.",
    },
    SimulatedFinding {
        bbox: [200, 220, 300, 350],
        label: "using phone",
        color: Rgb([255, 165, 0]),
        confidence: 0.85,
        description: "Student appears to be using a mobile device.",
    },
    SimulatedFinding {
        bbox: [380, 80, 480, 200],
        label: "sleeping",
        color: Rgb([255, 0, 0]),
        confidence: 0.78,
        description: "Student's posture suggests they may be asleep at the desk.",
    },
];

impl SimulatedFinding {
    pub fn to_finding(&self) -> Finding {
        Finding {
            label: self.label.to_string(),
            confidence: self.confidence,
            description: self.description.to_string(),
            bbox: Some(self.bbox),
        }
    }
}
