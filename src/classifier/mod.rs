pub mod classifier;

pub use classifier::{
    DEFAULT_INPUT_WIDTH,
    ATTACK_THRESHOLD,
    Classifier,
    ClassifiedFlow,
    ClassifierHandles,
    Inference,
    InputShaper,
    NidsModel,
    NoModel,
    Scaler,
    decode_output,
    load_label_vector,
    spawn_classifier,
};
